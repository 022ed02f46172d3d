use crate::model::{Axis, Outbound};
use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GCodeError {
    #[error("Empty response line")]
    Empty,
    #[error("Invalid response code: {0}")]
    ParseError(String),
}

static HOMING_COMMAND: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*\$H[XYZ]?\s*$").expect("homing pattern is valid"));

static NUMBERED_RESPONSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(error|alarm):\s*(\S*)$").expect("response pattern is valid")
});

// Grbl real-time commands, sent outside the line protocol
const JOG_CANCEL: char = '\u{85}';
const FEED_HOLD: char = '!';
const SOFT_RESET: char = '\u{18}';

/// Synchronizing dwell; Grbl only acknowledges it once the planner has drained.
pub const SYNC: &str = "G4 P0";

/// A line sent back by the firmware in reply to a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Ok,
    Error(u16),
    Alarm(u16),
    Message(String),
}

/// Classify a response line from the firmware.
pub fn parse_ack(line: &str) -> Result<Ack, GCodeError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(GCodeError::Empty);
    }
    if line.eq_ignore_ascii_case("ok") {
        return Ok(Ack::Ok);
    }

    let Some(caps) = NUMBERED_RESPONSE.captures(line) else {
        return Ok(Ack::Message(line.to_string()));
    };
    let code = caps[2]
        .parse::<u16>()
        .map_err(|_| GCodeError::ParseError(line.to_string()))?;
    if caps[1].eq_ignore_ascii_case("error") {
        Ok(Ack::Error(code))
    } else {
        Ok(Ack::Alarm(code))
    }
}

/// True when a line written to the firmware starts a homing cycle (`$H`, `$HZ`, ...).
pub fn is_homing_command(line: &str) -> bool {
    HOMING_COMMAND.is_match(line)
}

/// Up to three decimals, trailing zeros dropped (900 -> "900", 247.5 -> "247.5").
pub fn format_number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "" | "-" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

pub fn jog(axis: Axis, distance: f64, feed: f64) -> String {
    format!("$J=G91 G21 {}{:.3} F{}", axis, distance, format_number(feed))
}

/// Make the current position the work zero of `axis`.
pub fn zero_axis(axis: Axis) -> String {
    format!("G10 L20 P1 {}0", axis)
}

/// Rapid to an absolute machine Z.
pub fn return_to_z(z: f64) -> String {
    format!("G53 G0 Z{:.3}", z)
}

/// The touch-plate probing moves, in the order they must be sent.
pub fn probe_sequence(
    travel: f64,
    feed: f64,
    fine_feed: f64,
    plate_thickness: f64,
    start_z: f64,
) -> Vec<String> {
    vec![
        "G91".to_string(),
        format!("G38.2 Z-{:.3} F{}", travel, format_number(feed)),
        "G0 Z1".to_string(),
        format!("G38.2 Z-2 F{}", format_number(fine_feed)),
        format!("G10 L20 P1 Z{}", format_number(plate_thickness)),
        // Give the controller time to write the offset to EEPROM
        "G4 P0.25".to_string(),
        return_to_z(start_z),
        "G90".to_string(),
    ]
}

/// The literal text the firmware receives for a command.
pub fn to_line(command: &Outbound) -> String {
    match command {
        Outbound::Gcode { code } => code.clone(),
        Outbound::Jog {
            axis,
            distance,
            feed,
        } => jog(*axis, *distance, *feed),
        Outbound::JogCancel => JOG_CANCEL.to_string(),
        Outbound::Feedhold => FEED_HOLD.to_string(),
        Outbound::Reset => SOFT_RESET.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acks_are_classified() {
        assert_eq!(parse_ack("ok\r\n"), Ok(Ack::Ok));
        assert_eq!(parse_ack("error:9"), Ok(Ack::Error(9)));
        assert_eq!(parse_ack("ALARM:1"), Ok(Ack::Alarm(1)));
        assert_eq!(
            parse_ack("[MSG:Caution: Unlocked]"),
            Ok(Ack::Message("[MSG:Caution: Unlocked]".to_string()))
        );
        assert_eq!(parse_ack("   "), Err(GCodeError::Empty));
        assert!(matches!(parse_ack("error:x"), Err(GCodeError::ParseError(_))));
    }

    #[test]
    fn homing_commands_are_detected() {
        assert!(is_homing_command("$H"));
        assert!(is_homing_command(" $hz \n"));
        assert!(!is_homing_command("$X"));
        assert!(!is_homing_command("G0 X1 ; $H"));
        assert!(!is_homing_command("$HX5"));
    }

    #[test]
    fn jog_lines_match_grbl_syntax() {
        assert_eq!(jog(Axis::X, 1.0, 900.0), "$J=G91 G21 X1.000 F900");
        assert_eq!(jog(Axis::Z, -0.25, 247.5), "$J=G91 G21 Z-0.250 F247.5");
    }

    #[test]
    fn numbers_drop_trailing_zeros() {
        assert_eq!(format_number(900.0), "900");
        assert_eq!(format_number(247.50000000000003), "247.5");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(-0.0001), "0");
        assert_eq!(format_number(12.125), "12.125");
    }

    #[test]
    fn probe_sequence_order() {
        let lines = probe_sequence(40.5, 100.0, 20.0, 15.0, -5.0);
        assert_eq!(
            lines,
            vec![
                "G91",
                "G38.2 Z-40.500 F100",
                "G0 Z1",
                "G38.2 Z-2 F20",
                "G10 L20 P1 Z15",
                "G4 P0.25",
                "G53 G0 Z-5.000",
                "G90",
            ]
        );
    }
}
