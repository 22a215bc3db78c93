use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use serde_json::json;
use shadow_engine::classifier::{classify, detect_parameter_error, StepContext};
use shadow_engine::config::ResilienceConfig;
use shadow_engine::repair::{analyze_upstream_data, apply_repair, propose_repair};
use shadow_types::{
    FailureCategory, FailureClassification, FailureSubType, Severity, StepError, StepOutput,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Command::new("shadow-probe")
        .version(shadow_engine::VERSION)
        .about("Inspect how the resilience engine sees an error, a payload or a config")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("classify")
                .about("Classify a step error")
                .arg(
                    Arg::new("message")
                        .long("message")
                        .required(true)
                        .help("Error message"),
                )
                .arg(Arg::new("code").long("code").help("Error code or HTTP status"))
                .arg(
                    Arg::new("step-type")
                        .long("step-type")
                        .help("Type of the failing step"),
                ),
        )
        .subcommand(
            Command::new("analyze")
                .about("Analyze an upstream JSON payload and propose a repair")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .required(true)
                        .help("JSON file holding the upstream step's data"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Load, validate and print a TOML config")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .required(true)
                        .help("TOML config file"),
                ),
        );

    let matches = cli.get_matches();
    let output = match matches.subcommand() {
        Some(("classify", args)) => run_classify(args),
        Some(("analyze", args)) => run_analyze(args)?,
        Some(("config", args)) => run_config(args)?,
        _ => anyhow::bail!("unknown subcommand"),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn run_classify(args: &ArgMatches) -> serde_json::Value {
    let message = args.get_one::<String>("message").cloned().unwrap_or_default();
    let mut error = StepError::new(message);
    error.code = args.get_one::<String>("code").cloned();
    let step_type = args.get_one::<String>("step-type").map(String::as_str);

    let step = StepContext {
        step_id: "probe",
        step_name: "probe",
        step_type,
    };
    let classification = classify(&error, &step);
    json!({
        "classification": classification,
        "parameter_error": detect_parameter_error(&error.message),
    })
}

fn run_analyze(args: &ArgMatches) -> anyhow::Result<serde_json::Value> {
    let path = args
        .get_one::<String>("file")
        .context("--file is required")?;
    let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {path}"))?;
    let data: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("{path} is not valid JSON"))?;

    let analysis = analyze_upstream_data(&data);
    let classification = FailureClassification::new(FailureCategory::DataShapeMismatch, Severity::High)
        .with_sub_type(FailureSubType::Generic);
    let upstream = StepOutput::new(data);
    let proposal = propose_repair(&classification, "downstream", "upstream", &upstream);
    let repaired = apply_repair(&proposal, &upstream).map(|o| o.data);

    Ok(json!({
        "analysis": analysis,
        "proposal": proposal,
        "repaired": repaired,
    }))
}

fn run_config(args: &ArgMatches) -> anyhow::Result<serde_json::Value> {
    let path = args
        .get_one::<String>("file")
        .context("--file is required")?;
    let config = ResilienceConfig::from_path(path).with_context(|| format!("invalid config {path}"))?;
    Ok(serde_json::to_value(config)?)
}
