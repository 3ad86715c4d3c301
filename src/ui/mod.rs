use std::io::IsTerminal;

mod spinner;
mod status;
mod table;

pub use spinner::spinner_bar;
pub use status::{print_command_status, CommandStatus};
pub use table::{key_value_table, stats_table};

/// True when both stdin and stderr are attached to a terminal.
pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}
