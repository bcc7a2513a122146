pub mod loader;

pub use loader::{CONFIG_FILE, WEIGHTS_FILE, load_checkpoint, load_config, save_checkpoint};
