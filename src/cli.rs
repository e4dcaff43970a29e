use clap::{Parser, Subcommand};
use toolport::catalog::StatusFilter;

fn get_version() -> &'static str {
    const BASE_VERSION: &str = env!("CARGO_PKG_VERSION");

    // Release builds carry the tag alone.
    if let Some(tag) = option_env!("TOOLPORT_GIT_TAG") {
        return tag;
    }

    let commit = option_env!("TOOLPORT_GIT_COMMIT").unwrap_or("unknown");
    let branch = option_env!("TOOLPORT_GIT_BRANCH").unwrap_or("unknown");

    // Leaked once at startup.
    let version = format!("v{}-{} ({})", BASE_VERSION, commit, branch);
    Box::leak(version.into_boxed_str())
}

#[derive(Parser)]
#[command(name = "toolport")]
#[command(about = "Download, track and update tools from a remote catalog")]
#[command(version = get_version(), propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (use multiple times for more detail)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce output to errors only
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List catalog tools with their local status
    Tools {
        /// Only show tools in this state
        #[arg(long, value_enum, default_value_t = StatusFilter::All)]
        filter: StatusFilter,
        /// Case-insensitive match on name, description or author
        #[arg(long)]
        search: Option<String>,
    },

    /// Download a tool from the catalog
    #[command(after_help = "Examples:\n  toolport download 12\n  toolport -v download \"Level Packer\"")]
    Download {
        /// Catalog id or name of the tool
        tool_id: String,
    },

    /// Download newer versions of installed tools
    Update {
        /// Tool to update, or 'all' for every outdated tool
        tool_id: String,
    },

    /// List downloaded files
    Local,

    /// Show the recorded version of every downloaded tool
    Versions,

    /// Delete a downloaded tool
    Remove {
        tool_id: String,
    },

    /// Open a downloaded tool with the system's default handler
    Open {
        tool_id: String,
    },

    /// Compare two version strings (prints -1, 0 or 1)
    Compare {
        version1: String,
        version2: String,
    },

    /// Check whether a newer launcher release is available
    CheckUpdate,

    /// Manage toolport's configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Serve JSON-lines requests on stdin for a desktop front end
    Serve,

    /// Show the current version
    Version,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration setting
    Get {
        /// Key to get (if omitted, shows all settings)
        key: Option<String>,
    },
    /// Set a configuration setting
    Set {
        /// Key and value (e.g., 'download-dir=/data/tools' or 'download-dir /data/tools')
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },
    /// Reset a configuration setting to its default
    Unset {
        /// Key to unset (e.g., 'counter-url')
        key: String,
    },
    /// Show full configuration
    Show {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}
