use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pelican")]
#[command(about = "Pelican - geospatial process orchestrator", long_about = None)]
pub struct Cli {
    /// Configuration file path (overrides PELICAN_CONFIG_PATH)
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run database migrations and register the builtin processes
    Migrate,

    /// Run a worker processing queued jobs
    Worker {
        /// Worker ID (auto-generated if not provided)
        #[arg(long = "worker-id")]
        worker_id: Option<String>,
    },

    /// Deploy a process from a package file or reference URL
    Deploy {
        /// Process identifier
        id: String,

        /// Package file path or URL
        reference: String,

        /// Make the process public immediately
        #[arg(long = "public")]
        public: bool,
    },

    /// List deployed processes
    Processes,

    /// Get the status of a job
    Status {
        /// Job ID to query
        job_id: uuid::Uuid,
    },

    /// List jobs
    Jobs {
        /// Filter by process
        #[arg(short = 'p', long = "process")]
        process: Option<String>,

        /// Filter by status
        #[arg(short = 's', long = "status")]
        status: Option<String>,

        /// Number of results (default: 20)
        #[arg(short = 'l', long = "limit", default_value = "20")]
        limit: i64,
    },

    /// Dismiss a queued or running job
    Dismiss {
        /// Job ID to dismiss
        job_id: uuid::Uuid,
    },
}
