use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::records::Namespace;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct NamespaceArgs {
    /// Operate on the bundled default records instead of your own
    #[clap(long, default_value = "false")]
    pub default: bool,
}

impl NamespaceArgs {
    pub fn namespace(&self) -> Namespace {
        if self.default {
            Namespace::Default
        } else {
            Namespace::User
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search records by name, alternative name and notes
    Search {
        /// Search text
        #[clap(required = true, num_args = 1..)]
        query: Vec<String>,

        /// Print results as json
        #[clap(long, default_value = "false")]
        json: bool,

        /// Skip semantic search
        #[clap(long, default_value = "false")]
        lexical_only: bool,
    },
    /// Rebuild the text index and embed records missing a vector
    Index {},
    /// Add a record and index it
    Add {
        /// Record name
        #[clap(short, long)]
        name: String,

        /// Alternative name, e.g. a translation
        #[clap(short, long)]
        alt_name: Option<String>,

        /// Free-form notes
        #[clap(long)]
        notes: Option<String>,

        #[clap(flatten)]
        ns: NamespaceArgs,
    },
    /// Update a record. Pass an empty string to clear a field.
    Update {
        id: u64,

        #[clap(short, long)]
        name: Option<String>,

        #[clap(short, long)]
        alt_name: Option<String>,

        #[clap(long)]
        notes: Option<String>,

        #[clap(flatten)]
        ns: NamespaceArgs,
    },
    /// Delete a record
    Delete {
        id: u64,

        #[clap(flatten)]
        ns: NamespaceArgs,
    },
    /// Show record and index counts
    Status {
        /// Print status as json
        #[clap(long, default_value = "false")]
        json: bool,
    },
}
