//! Errors reported back on the command channel.

use thiserror::Error;

use bbque_app::AppError;
use bbque_res::AccountError;
use bbque_sched::SchedError;
use bbque_sync::PlatformError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    App(#[from] AppError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("unknown recipe: {0}")]
    UnknownRecipe(String),

    #[error(transparent)]
    Sched(#[from] SchedError),
}

impl CommandError {
    /// Exit code printed after `err`.
    pub fn code(&self) -> i32 {
        match self {
            CommandError::Usage(_) => 1,
            CommandError::App(_) => 2,
            CommandError::Account(_) => 3,
            CommandError::Platform(_) => 4,
            CommandError::UnknownRecipe(_) => 5,
            CommandError::Sched(_) => 6,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
