mod logic;

pub use logic::{fetch_backup, run_restore};
