#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;

use clap::{Args, CommandFactory, Parser, Subcommand};
use eyre::{Context, Result};

use crate::config::{self, Configuration, load_configuration, lookup_config_path};
use crate::models::{ConversationId, TaskId};

#[derive(Debug, Parser)]
#[command(
    version,
    about,
    long_about = r#"A personal assistant that keeps projects, conversations and messages in SQLite

Default configuration file location looks up in the following order:
    * $XDG_CONFIG_HOME/personal-agent/config.toml
    * $HOME/.config/personal-agent/config.toml
    * $HOME/.personal-agent.toml
"#,
    disable_version_flag = true
)]
pub struct Command {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Show the version
    #[arg(short, long)]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage projects
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage conversations
    #[command(subcommand)]
    Chat(ChatCommand),

    /// Print the messages of a conversation
    History {
        /// Conversation id
        chat: ConversationId,
    },

    /// Send a message and wait for the agent's reply
    Send(SendArgs),

    /// Manage the tasks of a project
    #[command(subcommand)]
    Task(TaskCommand),

    /// Upgrade an older database so deletes cascade
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum ProjectCommand {
    /// List projects by name
    List,
    /// Create a project
    Create {
        name: String,
        /// Background the agent should know about
        #[arg(long)]
        context: Option<String>,
    },
    /// Rename a project
    Rename { name: String, new_name: String },
    /// Show the project context, or replace it when TEXT is given
    Context {
        name: String,
        text: Option<String>,
        /// Remove the context
        #[arg(long, conflicts_with = "text")]
        clear: bool,
    },
    /// Delete a project with its conversations, messages and tasks
    Delete { name: String },
}

#[derive(Debug, Subcommand)]
pub enum ChatCommand {
    /// List the conversations of a project, or the free ones
    List {
        #[arg(short, long)]
        project: Option<String>,
    },
    /// Start a conversation
    Create {
        #[arg(short, long)]
        project: Option<String>,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Rename a conversation
    Rename { id: ConversationId, name: String },
    /// Delete a conversation and its messages
    Delete { id: ConversationId },
    /// Remove every message of a conversation
    Clear { id: ConversationId },
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Conversation to continue; a new one is started when omitted
    #[arg(long, conflicts_with = "project")]
    pub chat: Option<ConversationId>,

    /// Project the new conversation belongs to
    #[arg(short, long)]
    pub project: Option<String>,

    /// Mark the message as transcribed from voice
    #[arg(long)]
    pub voice: bool,

    /// Print the reply while it is generated
    #[arg(long)]
    pub stream: bool,

    pub text: String,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Add a task to a project
    Add { project: String, description: String },
    /// List the tasks of a project
    List { project: String },
    /// Change the status of a task
    Status { id: TaskId, status: String },
}

impl Command {
    pub fn new() -> Command {
        Self::parse()
    }

    pub fn get_config(&self) -> Result<Configuration> {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| lookup_config_path().unwrap_or_default());

        if config_path.is_empty() {
            // No config path is specified just use the default config
            return Ok(Configuration::default());
        }
        load_configuration(config_path.as_str()).wrap_err("loading configuration")
    }

    pub fn version(&self) -> bool {
        self.version
    }

    pub fn subcommand(&self) -> Option<&Commands> {
        self.command.as_ref()
    }

    pub fn print_version(&self) {
        println!("{}", config::version())
    }

    pub fn print_help() -> Result<()> {
        <Self as CommandFactory>::command()
            .print_help()
            .wrap_err("printing help")
    }
}
