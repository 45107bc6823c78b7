mod backends;
mod catalog_cmd;
mod config;
mod generate_cmd;
mod lesson_cmd;
mod serve_cmd;

#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use config::{CliOverrides, TermplanConfig};
use generate_cmd::OutputFormat;
use lesson_cmd::{HomeworkArg, StyleArg};

#[derive(Parser)]
#[command(name = "termplan", about = "Retrieval-augmented curriculum term planner")]
struct Cli {
    /// Config file (default: ~/.config/termplan/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Qdrant URL (overrides QDRANT_URL env var)
    #[arg(long, global = true)]
    qdrant_url: Option<String>,

    /// Chat model name (overrides LLM_MODEL env var)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Log filter used when RUST_LOG is unset (overrides LOG_LEVEL env var)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a termplan config file
    Init {
        /// Qdrant URL to store in the config file
        #[arg(long = "store-url")]
        store_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Serve the HTTP API
    Serve {
        /// Address to bind (default 127.0.0.1)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (default 8000)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Generate one term plan and print it
    Generate {
        #[arg(long)]
        curriculum: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        grade: String,
        /// Number of terms to plan
        #[arg(long, default_value_t = 3)]
        terms: u32,
        #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Generate a series of lesson plans from a syllabus
    Lesson {
        /// Syllabus text
        #[arg(long, conflicts_with = "syllabus_file", required_unless_present = "syllabus_file")]
        syllabus: Option<String>,
        /// Read the syllabus from a file
        #[arg(long)]
        syllabus_file: Option<PathBuf>,
        /// Number of classes (1-50)
        #[arg(long, default_value_t = 5)]
        classes: u32,
        /// Length of each class
        #[arg(long, default_value = "45 minutes")]
        duration: String,
        #[arg(long, value_enum, default_value_t = StyleArg::Interactive)]
        style: StyleArg,
        #[arg(long, value_enum, default_value_t = HomeworkArg::Moderate)]
        homework: HomeworkArg,
    },
    /// Browse the built-in project and assessment catalog
    Catalog {
        #[command(subcommand)]
        command: CatalogCommands,
    },
    /// List the collections of the configured vector store
    Collections,
    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// List project templates
    Projects {
        #[arg(long)]
        subject: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List assessment criteria
    Criteria {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

// -----------------------------------------------------------------------
// init
// -----------------------------------------------------------------------

fn cmd_init(config_override: Option<PathBuf>, store_url: Option<String>, force: bool) -> anyhow::Result<()> {
    let path = config_override.unwrap_or_else(config::config_path);

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        server: config::ServerSection {
            host: Some(config::DEFAULT_HOST.to_string()),
            port: Some(config::DEFAULT_PORT),
            cors_origins: Vec::new(),
        },
        vector_store: config::VectorStoreSection {
            url: store_url.clone(),
            ..Default::default()
        },
        ..Default::default()
    };

    config::save_config_to(&cfg, &path)?;

    println!("Config written to {}", path.display());
    println!("  server = {}:{}", config::DEFAULT_HOST, config::DEFAULT_PORT);
    match store_url {
        Some(url) => println!("  vector_store.url = {url}"),
        None => println!("  vector_store = built-in catalog (in memory)"),
    }
    println!("API keys are read from GROQ_API_KEY / OPENAI_API_KEY.");

    Ok(())
}

// -----------------------------------------------------------------------
// main
// -----------------------------------------------------------------------

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            token.cancel();
        }
    });
}

fn init_tracing(log_level: Option<&str>) {
    let fallback = log_level
        .map(str::to_string)
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback.to_lowercase())),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let overrides = CliOverrides {
        config: cli.config.clone(),
        qdrant_url: cli.qdrant_url.clone(),
        model: cli.model.clone(),
        ..CliOverrides::default()
    };

    match cli.command {
        Commands::Init { store_url, force } => cmd_init(cli.config, store_url, force),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "termplan", &mut std::io::stdout());
            Ok(())
        }
        Commands::Catalog { command } => match command {
            CatalogCommands::Projects { subject, json } => {
                catalog_cmd::run_projects(subject.as_deref(), json)
            }
            CatalogCommands::Criteria { subject, json } => {
                catalog_cmd::run_criteria(subject.as_deref(), json)
            }
        },
        Commands::Serve { host, port } => {
            let config = TermplanConfig::resolve(&CliOverrides {
                host,
                port,
                ..overrides
            })?;
            serve_cmd::run_serve(&config).await
        }
        Commands::Generate {
            curriculum,
            subject,
            grade,
            terms,
            format,
            output,
        } => {
            let config = TermplanConfig::resolve(&overrides)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let request = termplan_core::PlanRequest::new(curriculum, subject, grade, terms);
            generate_cmd::run_generate(&config, request, format, output.as_deref(), &cancel).await
        }
        Commands::Lesson {
            syllabus,
            syllabus_file,
            classes,
            duration,
            style,
            homework,
        } => {
            let config = TermplanConfig::resolve(&overrides)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let syllabus = lesson_cmd::read_syllabus(syllabus, syllabus_file.as_deref())?;
            let request = termplan_core::lesson::LessonPlanRequest {
                syllabus,
                num_classes: classes,
                class_duration: duration,
                teaching_style: style.into(),
                homework_preference: homework.into(),
            };
            lesson_cmd::run_lesson(&config, &request, &cancel).await
        }
        Commands::Collections => {
            let config = TermplanConfig::resolve(&overrides)?;
            catalog_cmd::run_collections(&config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn generate_parses_with_defaults() {
        let cli = Cli::try_parse_from([
            "termplan", "generate", "--curriculum", "National", "--subject", "Math", "--grade", "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Generate { terms, format, output, .. } => {
                assert_eq!(terms, 3);
                assert_eq!(format, OutputFormat::Json);
                assert!(output.is_none());
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn lesson_requires_a_syllabus() {
        assert!(Cli::try_parse_from(["termplan", "lesson"]).is_err());
        assert!(
            Cli::try_parse_from([
                "termplan",
                "lesson",
                "--syllabus",
                "Fractions",
                "--syllabus-file",
                "s.txt",
            ])
            .is_err()
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "termplan",
            "collections",
            "--qdrant-url",
            "http://qdrant:6333",
        ])
        .unwrap();
        assert_eq!(cli.qdrant_url.as_deref(), Some("http://qdrant:6333"));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        cmd_init(Some(path.clone()), None, false).unwrap();
        assert!(cmd_init(Some(path.clone()), None, false).is_err());
        cmd_init(Some(path.clone()), Some("http://qdrant:6333".into()), true).unwrap();

        let loaded = config::load_config_from(&path).unwrap();
        assert_eq!(loaded.vector_store.url.as_deref(), Some("http://qdrant:6333"));
        assert_eq!(loaded.server.port, Some(config::DEFAULT_PORT));
    }
}
