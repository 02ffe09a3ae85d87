use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use forecast_orchestrator::compare::DEFAULT_TOLERANCE;
use forecast_orchestrator::{
    ComparisonReport, DatabaseConfig, DatabaseKind, ModelName, Month, OutputFormat, RunId, RunMode,
    RunParameters, RunRecordStore, RunReport, RunStatus, Services, compare_results,
    compare_structure, compare_structure_database, create_connection, drop_tables, ensure_schema,
    load_platform_config,
};

#[derive(Parser)]
#[command(name = "forecast-orchestrator")]
#[command(about = "Account-level demand forecast runs")]
struct Cli {
    /// Run record store url (e.g. surrealkv://forecast_store, memory)
    #[arg(long, global = true, env = "FORECAST_DB_URL")]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Number of months to predict
    #[arg(long)]
    forecast_periods: Option<u32>,
    /// Directory receiving forecast files
    #[arg(long)]
    output_location: Option<PathBuf>,
    /// Format of forecast files
    #[arg(long, default_value = "csv", value_parser = parse_output_format)]
    output_format: OutputFormat,
    /// Only run these model configs
    #[arg(long = "only-model-config")]
    only_model_config: Vec<String>,
    /// Skip these model configs
    #[arg(long = "exclude-model-config", conflicts_with = "only_model_config")]
    exclude_model_config: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward forecast written to the warehouse
    Production {
        /// First predicted month (YYYYMM), defaults to the current month
        #[arg(long, value_parser = parse_month)]
        prediction_start_month: Option<Month>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Forward forecast written to files
    Development {
        /// First predicted month (YYYYMM), defaults to the current month
        #[arg(long, value_parser = parse_month)]
        prediction_start_month: Option<Month>,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Historical forecast validated against recorded sales
    Backward {
        /// Last predicted month (YYYYMM), defaults to the current month
        #[arg(long, value_parser = parse_month)]
        prediction_end_month: Option<Month>,
        /// Import the input extract again instead of reusing cleaned data
        #[arg(long, default_value_t = false)]
        force_reload: bool,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Create the tables of a database
    SetupDatabase {
        #[arg(value_enum)]
        database: DatabaseArg,
        /// Delete existing tables and their data first
        #[arg(long, default_value_t = false)]
        drop_tables: bool,
    },
    /// Report environment and connectivity status
    Info,
    /// Check forecast files of a run against its manifest
    CompareStructure { directory: PathBuf },
    /// Check the newest completed production run in the database
    CompareStructureDatabase,
    /// Compare persisted predictions with a reference CSV
    CompareResults {
        reference: PathBuf,
        #[arg(long)]
        run_id: Option<u64>,
        #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
        tolerance: f64,
    },
    /// Stop an active run before its next model config
    Abort {
        run_id: u64,
        /// Mark the run aborted immediately (for runs whose process is gone)
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DatabaseArg {
    Internal,
    DsxWrite,
}

impl From<DatabaseArg> for DatabaseKind {
    fn from(arg: DatabaseArg) -> Self {
        match arg {
            DatabaseArg::Internal => DatabaseKind::Internal,
            DatabaseArg::DsxWrite => DatabaseKind::DsxWrite,
        }
    }
}

fn parse_month(value: &str) -> Result<Month, String> {
    Month::parse(value).map_err(|e| e.to_string())
}

fn parse_output_format(value: &str) -> Result<OutputFormat, String> {
    OutputFormat::parse(value).map_err(|e| e.to_string())
}

fn run_parameters(prediction_month: Option<Month>, force_reload: bool, run: RunArgs) -> RunParameters {
    RunParameters {
        forecast_periods: run.forecast_periods,
        prediction_month,
        output_location: run.output_location,
        output_format: run.output_format,
        only_model_configs: run.only_model_config.into_iter().map(ModelName::from).collect(),
        exclude_model_configs: run.exclude_model_config.into_iter().map(ModelName::from).collect(),
        force_reload,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("forecast_orchestrator=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut db_config = DatabaseConfig::default();
    if let Some(url) = cli.db_url {
        db_config.url = url;
    }
    info!("Using database url: {}", db_config.url);

    match cli.command {
        Commands::Production {
            prediction_start_month,
            run,
        } => {
            forecast(db_config, RunMode::Production, run_parameters(prediction_start_month, false, run)).await
        }
        Commands::Development {
            prediction_start_month,
            run,
        } => {
            forecast(db_config, RunMode::Development, run_parameters(prediction_start_month, false, run)).await
        }
        Commands::Backward {
            prediction_end_month,
            force_reload,
            run,
        } => {
            forecast(db_config, RunMode::Backward, run_parameters(prediction_end_month, force_reload, run)).await
        }
        Commands::SetupDatabase {
            database,
            drop_tables: drop,
        } => {
            let kind = DatabaseKind::from(database);
            let db = create_connection(db_config).await?;
            if drop {
                warn!("Dropping all tables of the {} database", kind.as_str());
                drop_tables(&db, kind).await?;
            }
            ensure_schema(&db, kind).await?;
            info!("Database {} set up successfully", kind.as_str());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Info => {
            let platform = load_platform_config()?;
            let services = Services::init(db_config, platform).await?;
            let env = services.environment_info().await?;

            println!("Database:        {} ({}/{})", env.database_url, env.namespace, env.database);
            println!("Internal tables: {}", env.internal_tables.join(", "));
            println!("DSX tables:      {}", env.dsx_write_tables.join(", "));
            match &env.active_run {
                Some(run) => println!("Active run:      {} ({}, {})", run.run_id, run.mode, run.status),
                None => println!("Active run:      none"),
            }
            println!("Model configs:   {}", env.model_configs);
            match &env.engine_health {
                Ok(status) => println!("Engine:          {} ({status})", env.engine),
                Err(e) => println!("Engine:          {} (unavailable: {e})", env.engine),
            }
            Ok(if env.engine_health.is_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::CompareStructure { directory } => {
            Ok(print_comparison(&compare_structure(&directory)?))
        }
        Commands::CompareStructureDatabase => {
            let platform = load_platform_config()?;
            let services = Services::init(db_config, platform).await?;
            let report = compare_structure_database(services.store(), services.registry()).await?;
            Ok(print_comparison(&report))
        }
        Commands::CompareResults {
            reference,
            run_id,
            tolerance,
        } => {
            let store = RunRecordStore::new(create_connection(db_config).await?);
            let report = compare_results(&store, &reference, run_id.map(RunId), tolerance).await?;
            Ok(print_comparison(&report))
        }
        Commands::Abort { run_id, force } => {
            let run_id = RunId(run_id);
            let store = RunRecordStore::new(create_connection(db_config).await?);
            if force {
                store
                    .transition_run(run_id, RunStatus::Aborted, Some("forced abort".to_string()))
                    .await?;
                println!("Run {run_id} marked aborted.");
                return Ok(ExitCode::SUCCESS);
            }
            if store.request_abort(run_id).await? {
                println!("Abort requested for run {run_id}, it stops before its next model config.");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Run {run_id} is not active.");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn forecast(db_config: DatabaseConfig, mode: RunMode, params: RunParameters) -> Result<ExitCode> {
    let platform = load_platform_config()?;
    let services = Services::init(db_config, platform).await?;
    let orchestrator = services.orchestrator();

    let run_id = match orchestrator.start(mode, params).await {
        Ok(run_id) => run_id,
        Err(e) => {
            error!("Could not start {mode} run: {e}");
            return Ok(ExitCode::FAILURE);
        }
    };

    if let Some(handle) = orchestrator.abort_handle(run_id).await {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, aborting after the current model run");
                handle.abort();
            }
        });
    }

    match orchestrator.execute(run_id).await {
        Ok(report) => {
            print_report(&report);
            Ok(if report.succeeded() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(e) => {
            error!("Run {run_id} failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &RunReport) {
    println!("Run {} ({}) finished: {}", report.run_id, report.mode, report.status);
    if let Some(cause) = &report.cause {
        println!("  Cause: {cause}");
    }
    for model_run in &report.model_runs {
        println!(
            "  {:<32} {:<10} attempts={}",
            model_run.model_name.as_str(),
            model_run.status.as_str(),
            model_run.attempts
        );
    }
    let failed = report.failed_models();
    if !failed.is_empty() {
        println!("Failed accounts:");
        for model_run in failed {
            println!(
                "  {} ({}): {}",
                model_run.account,
                model_run.error_cause.map(|c| c.as_str()).unwrap_or("unknown"),
                model_run.error.as_deref().unwrap_or("-")
            );
        }
    }
    if let Some(output) = &report.output {
        println!("Output: {output:?}");
    }
}

fn print_comparison(report: &ComparisonReport) -> ExitCode {
    print!("{report}");
    if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
