//! Steps shared by every target.

mod sshuttle;

pub use sshuttle::{SshuttleStep, PYTHON_VENV_PATH};
