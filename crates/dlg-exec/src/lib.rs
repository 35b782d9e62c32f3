mod error;
pub use error::{ExecError, ExecResult};

pub mod criteria;
pub use criteria::{CommandAvailable, TcpReachable};

pub mod r#fn;
pub use r#fn::FnRunner;

#[cfg(feature = "shell")]
pub mod shell;
#[cfg(feature = "shell")]
pub use shell::{SHELL_SCRIPT, ShellRunner};

pub mod utils;
mod util;

pub mod watcher;
pub use watcher::ScriptWatcher;

pub mod prelude {
    pub use crate::FnRunner;
    pub use crate::error::{ExecError, ExecResult};
    #[cfg(feature = "shell")]
    pub use crate::shell::ShellRunner;
    pub use crate::watcher::ScriptWatcher;
}
