mod buttons;
mod feed_profile;
mod jogger;
mod motion;
mod prober;
mod settings;
mod state;

pub use buttons::*;
pub use feed_profile::*;
pub use jogger::*;
pub use motion::*;
pub use prober::*;
pub use settings::*;
pub use state::*;
