pub mod config;
pub mod error;
pub mod mail;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use mail::{MailAction, RenderedMail};
