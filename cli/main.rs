#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process;
use std::time::Duration;

use scoresheet::config::TrainerConfig;
use scoresheet::data::{DEFAULT_LABEL_COLUMN, load_feature_table, load_training_data};
use scoresheet::model::FittedScoringModel;
use scoresheet::polarity::{ScoringSheet, TargetClass};
use scoresheet::session::SheetSession;
use scoresheet::task::{TrainingOutcome, TrainingSession};
use scoresheet::trainer::ScoringSheetTrainer;

#[derive(Clone, Copy, ValueEnum)]
pub enum TargetCli {
    Positive,
    Negative,
}

impl From<TargetCli> for TargetClass {
    fn from(target: TargetCli) -> Self {
        match target {
            TargetCli::Positive => TargetClass::Positive,
            TargetCli::Negative => TargetClass::Negative,
        }
    }
}

#[derive(Args)]
pub struct TrainArgs {
    /// Path to a binarized training TSV file (feature columns plus a label column)
    pub training_data: String,

    /// Optional TOML file with trainer settings; flags below override it
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Name of the label column
    #[arg(long, default_value = DEFAULT_LABEL_COLUMN)]
    pub label_column: String,

    /// Number of decision parameters on the sheet
    #[arg(long, value_name = "K")]
    pub decision_params: Option<usize>,

    /// Maximum absolute points per decision parameter
    #[arg(long, value_name = "B")]
    pub max_points: Option<i64>,

    /// Maximum number of original attributes the sheet may use
    #[arg(long, value_name = "G")]
    pub input_features: Option<usize>,

    /// Width of the beam in the coefficient search
    #[arg(long)]
    pub beam_width: Option<usize>,

    /// Where to write the fitted model
    #[arg(long, default_value = "model.toml")]
    pub output: String,
}

#[derive(Args)]
pub struct SheetArgs {
    /// Path to a fitted model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Class whose risk the sheet reports
    #[arg(long, value_enum, default_value_t = TargetCli::Positive)]
    pub target: TargetCli,
}

#[derive(Args)]
pub struct InferArgs {
    /// Path to a TSV file with the same feature columns the model was trained on
    pub test_data: String,

    /// Path to a fitted model file (.toml)
    #[arg(long)]
    pub model: String,

    /// Name of the label column, ignored for prediction if present
    #[arg(long, default_value = DEFAULT_LABEL_COLUMN)]
    pub label_column: String,

    /// Where to write the predictions
    #[arg(long, default_value = "predictions.tsv")]
    pub output: String,
}

#[derive(Parser)]
#[command(
    name = "scoresheet",
    about = "Sparse integer scoring sheets with calibrated risk",
    long_about = "Fits scoring sheets (a few yes/no conditions worth integer points) on binarized \
                 tabular data, prints their score-to-risk tables and applies them to new data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a scoring sheet from training data
    #[command(about = "Fit a scoring sheet (outputs: model.toml)")]
    Train(TrainArgs),

    /// Print the decision parameters and the score/risk table of a fitted model
    #[command(about = "Print a fitted scoring sheet")]
    Sheet(SheetArgs),

    /// Apply a fitted model to new data
    #[command(about = "Apply a scoring sheet to new data (outputs: predictions.tsv)")]
    Infer(InferArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Sheet(args)) => sheet(args),
        Some(Commands::Infer(args)) => infer(args),
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_config(args: &TrainArgs) -> Result<TrainerConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading trainer settings from: {path}");
            TrainerConfig::load(path)?
        }
        None => TrainerConfig::default(),
    };
    if let Some(k) = args.decision_params {
        config.num_decision_params = k;
    }
    if let Some(bound) = args.max_points {
        config.max_points_per_param = bound;
    }
    if args.input_features.is_some() {
        config.num_input_features = args.input_features;
    }
    if let Some(width) = args.beam_width {
        config.optimizer.beam_width = width;
    }
    Ok(config)
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args)?;
    let trainer = ScoringSheetTrainer::new(config)?;

    let data = load_training_data(&args.training_data, &args.label_column)?;
    println!(
        "Loaded {} samples with {} features",
        data.num_samples(),
        data.num_features()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
    );
    spinner.set_message("Searching for a scoring sheet...");

    let mut session = TrainingSession::new(trainer);
    session.start(data);
    let outcome = loop {
        if let Some((_, outcome)) = session.wait_timeout(Duration::from_millis(100)) {
            break outcome;
        }
        spinner.tick();
    };

    let model = match outcome {
        TrainingOutcome::Completed(model) => {
            spinner.finish_with_message("Scoring sheet found.");
            model
        }
        TrainingOutcome::Failed(e) => {
            spinner.finish_and_clear();
            return Err(e.into());
        }
        TrainingOutcome::Cancelled => {
            spinner.finish_and_clear();
            return Err("training was cancelled".into());
        }
    };

    model.save(&args.output)?;
    println!("Model saved to: {}", args.output);

    let mut inspection = SheetSession::new();
    inspection.attach(model);
    print_sheet(inspection.derive()?);
    Ok(())
}

pub fn sheet(args: SheetArgs) -> Result<(), Box<dyn Error>> {
    println!("Loading model from: {}", args.model);
    let model = FittedScoringModel::load(&args.model)?;

    let mut session = SheetSession::new();
    session.set_target_class(args.target.into())?;
    session.attach(model);
    print_sheet(session.derive()?);
    Ok(())
}

fn print_sheet(sheet: &ScoringSheet) {
    println!();
    println!("Scoring sheet (target class: {})", sheet.target);
    if sheet.decision_parameters.is_empty() {
        println!("  (no decision parameters)");
    }
    let width = sheet
        .decision_parameters
        .iter()
        .map(|p| p.attribute.len())
        .max()
        .unwrap_or(0)
        .max("Attribute".len());
    println!("  {:<width$}  Points", "Attribute");
    for parameter in &sheet.decision_parameters {
        println!("  {:<width$}  {:>+6}", parameter.attribute, parameter.points);
    }

    println!();
    println!("  {:>10}  {:>9}", "Score", "Risk (%)");
    for row in sheet.table.rows() {
        println!("  {:>10}  {:>9.2}", row.score, row.probability);
    }
}

pub fn infer(args: InferArgs) -> Result<(), Box<dyn Error>> {
    println!("Loading model from: {}", args.model);
    let model = FittedScoringModel::load(&args.model)?;

    println!("Loading test data from: {}", args.test_data);
    let table = load_feature_table(&args.test_data, &args.label_column)?;
    let x = table.select_features(model.feature_names())?;
    println!("Loaded {} samples for prediction", x.nrows());

    let scores = model.total_scores(x.view())?;
    let probabilities = model.predict_proba(x.view())?;
    let labels = model.predict(x.view())?;

    let mut file = BufWriter::new(File::create(&args.output)?);
    writeln!(file, "sample_id\tscore\tprobability\tprediction")?;
    let mut buffer = ryu::Buffer::new();
    for (i, id) in table.sample_ids.iter().enumerate() {
        write!(file, "{id}\t{}\t", buffer.format(scores[i]))?;
        write!(file, "{}\t", buffer.format(probabilities[i]))?;
        writeln!(file, "{}", labels[i] as i64)?;
    }
    file.flush()?;
    println!("Predictions saved to: {}", args.output);
    Ok(())
}
