use crate::model::Outbound;
use log::{trace, warn};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Outbound side of the connection to CNCJS. Sends are fire-and-forget and
/// must be delivered in the order they were issued.
pub trait Transport: Send + Sync {
    fn send(&self, command: Outbound);
}

/// Keeps every command instead of delivering it.
#[derive(Default)]
pub struct CommandLog {
    commands: Mutex<Vec<Outbound>>,
}

impl CommandLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commands(&self) -> Vec<Outbound> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Drains the log.
    pub fn take(&self) -> Vec<Outbound> {
        self.commands
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }

    /// G-code text of the `Gcode` commands only.
    pub fn gcode(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Outbound::Gcode { code } => Some(code),
                _ => None,
            })
            .collect()
    }
}

impl Transport for CommandLog {
    fn send(&self, command: Outbound) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command);
        }
    }
}

/// Serializes each command as one JSON line on a writer, in order.
pub struct JsonLinesTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl JsonLinesTransport {
    /// Must be called inside a tokio runtime; the writer task ends when the
    /// transport is dropped.
    pub fn spawn<W>(mut writer: W) -> (Arc<Self>, tokio::task::JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let mut line = match serde_json::to_string(&command) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to encode {:?}: {}", command, e);
                        continue;
                    }
                };
                trace!("< {}", line);
                line.push('\n');
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!("Failed to write command: {}", e);
                    break;
                }
                let _ = writer.flush().await;
            }
        });
        (Arc::new(Self { tx }), handle)
    }
}

impl Transport for JsonLinesTransport {
    fn send(&self, command: Outbound) {
        if self.tx.send(command).is_err() {
            warn!("Command writer has stopped, dropping command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_log_keeps_order() {
        let log = CommandLog::new();
        log.send(Outbound::Gcode {
            code: "G91".to_string(),
        });
        log.send(Outbound::JogCancel);
        assert_eq!(log.gcode(), vec!["G91".to_string()]);
        assert_eq!(log.take().len(), 2);
        assert!(log.commands().is_empty());
    }

    #[tokio::test]
    async fn json_lines_are_written_in_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (transport, handle) = JsonLinesTransport::spawn(client);
        transport.send(Outbound::Feedhold);
        transport.send(Outbound::Reset);
        drop(transport);
        handle.await.unwrap();

        let mut out = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut out)
            .await
            .unwrap();
        assert_eq!(
            out,
            "{\"command\":\"feedhold\"}\n{\"command\":\"reset\"}\n"
        );
    }
}
