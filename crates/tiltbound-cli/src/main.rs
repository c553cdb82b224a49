//! CLI for tiltbound: reproducible QRNG bias bounds and constraint dominance.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tiltbound")]
#[command(about = "tiltbound: reproducible QRNG bias bounds and constraint dominance")]
#[command(version = tiltbound_core::VERSION)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a raw QRNG log against the data contract.
    /// Writes <stem>_validated.csv and <stem>_provenance.json.
    Validate {
        /// Raw CSV with timestamp, bit, source_id columns
        input: String,

        /// Output directory (defaults to the input's directory)
        #[arg(long)]
        out_dir: Option<String>,
    },

    /// Estimate per-source bias and pool into a calibration report.
    Calibrate {
        /// Raw or validated CSV files; each source_id is one source
        files: Vec<String>,

        /// Add a known-answer control source: "fair" or "biased:<p>"
        #[arg(long)]
        control: Vec<String>,

        /// Length of each control sequence
        #[arg(long, default_value = "200000")]
        n: usize,

        /// Symmetric Beta prior shape under the biased model
        #[arg(long)]
        prior: Option<f64>,

        /// Bootstrap resamples per source (0 = degenerate interval)
        #[arg(long, allow_hyphen_values = true)]
        bootstrap: Option<i64>,

        /// RNG seed for bootstrap resampling and controls
        #[arg(long)]
        seed: Option<u64>,

        /// Worker threads for bootstrap resampling (results do not change)
        #[arg(long)]
        threads: Option<usize>,

        /// Per-source bound: bootstrap_95, clopper_pearson_95 (alias chi2_95) or max_deviation
        #[arg(long)]
        bound_method: Option<String>,

        /// Rolling window in bits for the max-deviation statistic
        #[arg(long)]
        window: Option<usize>,

        /// JSON calibration config; flags override its values
        #[arg(long)]
        config: Option<String>,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Fit bit probability against the `s` covariate and check block-size stability.
    Modulation {
        /// Raw or validated CSV; an optional `s` column is the covariate
        input: String,

        /// Block sizes for the alternating-block stability check
        #[arg(long, value_delimiter = ',', default_values_t = tiltbound_core::modulation::DEFAULT_BLOCK_SIZES)]
        block_sizes: Vec<usize>,

        /// Write the summary here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Sweep a parameter grid and report which constraint dominates where.
    Sweep {
        /// Calibration report whose interval sets the QRNG tilt bound
        #[arg(long)]
        calibration: Option<String>,

        /// Explicit QRNG tilt bound (overrides --calibration)
        #[arg(long)]
        epsilon_max: Option<f64>,

        /// Grid coordinates: yukawa (lambda, alpha) or portal (m_phi, theta)
        #[arg(long, default_value = "yukawa", value_parser = ["yukawa", "portal"])]
        space: String,

        /// Portal model mapping theta to alpha
        #[arg(long, default_value = "simple", value_parser = ["simple", "scale_breaking", "portal"])]
        model: String,

        /// Symmetry-breaking scale in GeV for the scale_breaking model
        #[arg(long, default_value = "1.0")]
        mu_sb: f64,

        /// Portal coupling g for the portal model
        #[arg(long, default_value = "1.0")]
        g: f64,

        /// Lower edge of the x axis (lambda in m, or m_phi in GeV)
        #[arg(long)]
        x_min: Option<f64>,

        /// Upper edge of the x axis
        #[arg(long)]
        x_max: Option<f64>,

        /// Points along x
        #[arg(long, default_value = "100")]
        nx: usize,

        /// Lower edge of the y axis (alpha, or theta)
        #[arg(long)]
        y_min: Option<f64>,

        /// Upper edge of the y axis
        #[arg(long)]
        y_max: Option<f64>,

        /// Points along y
        #[arg(long, default_value = "100")]
        ny: usize,

        /// Fifth-force exclusion envelope CSV (lambda,alpha)
        #[arg(long)]
        envelope: Option<String>,

        /// Lab screening factor Theta_lab in (0, 1]
        #[arg(long)]
        theta_lab: Option<f64>,

        /// JSON constraint config; flags override its values
        #[arg(long)]
        config: Option<String>,

        /// Worker threads (results do not change)
        #[arg(long, default_value = "1")]
        threads: usize,

        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Run the regression/invariance harness. Exits 2 on drift.
    Regress {
        /// Base seed for the fixed-seed check
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Length of each synthetic source
        #[arg(long, default_value = "50000")]
        n: usize,

        /// Bootstrap resamples per source
        #[arg(long, default_value = "1000")]
        bootstrap: usize,

        /// Worker threads
        #[arg(long, default_value = "1")]
        threads: usize,

        /// Write the check summary here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },

    /// Emit a known-answer control sequence as contract-conformant CSV.
    Control {
        /// fair or biased
        #[arg(value_parser = ["fair", "biased"])]
        kind: String,

        /// Number of bits
        #[arg(long, default_value = "200000")]
        n: usize,

        /// Probability of a one (biased only)
        #[arg(long, default_value = "0.505")]
        p: f64,

        /// Shuffle seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// source_id written on every row
        #[arg(long)]
        source_id: Option<String>,

        /// RFC 3339 timestamp of the first row
        #[arg(long)]
        start: Option<String>,

        /// Write the CSV here instead of stdout
        #[arg(long)]
        output: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Validate { input, out_dir } => {
            commands::validate::run(&input, out_dir.as_deref())
        }
        Commands::Calibrate {
            files,
            control,
            n,
            prior,
            bootstrap,
            seed,
            threads,
            bound_method,
            window,
            config,
            output,
        } => commands::calibrate::run(commands::calibrate::CalibrateCommandConfig {
            files: &files,
            controls: &control,
            control_len: n,
            prior,
            bootstrap,
            seed,
            threads,
            bound_method: bound_method.as_deref(),
            window,
            config_path: config.as_deref(),
            output_path: output.as_deref(),
        }),
        Commands::Modulation {
            input,
            block_sizes,
            output,
        } => commands::modulation::run(&input, &block_sizes, output.as_deref()),
        Commands::Sweep {
            calibration,
            epsilon_max,
            space,
            model,
            mu_sb,
            g,
            x_min,
            x_max,
            nx,
            y_min,
            y_max,
            ny,
            envelope,
            theta_lab,
            config,
            threads,
            output,
        } => commands::sweep::run(commands::sweep::SweepCommandConfig {
            calibration_path: calibration.as_deref(),
            epsilon_max,
            space: &space,
            model: &model,
            mu_sb,
            g,
            x_range: (x_min, x_max),
            nx,
            y_range: (y_min, y_max),
            ny,
            envelope_path: envelope.as_deref(),
            theta_lab,
            config_path: config.as_deref(),
            threads,
            output_path: output.as_deref(),
        }),
        Commands::Regress {
            seed,
            n,
            bootstrap,
            threads,
            output,
        } => commands::regress::run(seed, n, bootstrap, threads, output.as_deref()),
        Commands::Control {
            kind,
            n,
            p,
            seed,
            source_id,
            start,
            output,
        } => commands::control::run(commands::control::ControlCommandConfig {
            kind: &kind,
            n,
            p,
            seed,
            source_id: source_id.as_deref(),
            start: start.as_deref(),
            output_path: output.as_deref(),
        }),
    };

    if let Err(e) = result {
        eprintln!("Error [{}]: {e}", e.kind());
        std::process::exit(commands::exit_code(&e));
    }
}
