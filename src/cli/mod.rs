pub mod commands;

pub use commands::{handle_subcommands, init_config, parse_address, parse_address_list};
