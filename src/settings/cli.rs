use super::Parser;

#[derive(Parser, Debug)]
#[command(name = "scriptorium", about = "Session and token lifecycle service")]
pub struct Cli {
    /// Path to a settings TOML file.
    #[arg(long)]
    pub settings: Option<String>,
}
