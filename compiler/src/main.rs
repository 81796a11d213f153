use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use abfc::pass::StageCert;
use abfc::{AutomaticBufferFusion, FusionConfig, Graph, ScopeAllocator};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Emit {
    /// Human-readable summary
    Report,
    /// Report as JSON
    Json,
    /// Graphviz DOT of the fused graph
    Dot,
    /// Annotated graph as JSON
    Graph,
}

#[derive(Parser, Debug)]
#[command(
    name = "abfc",
    version,
    about = "Automatic buffer fusion — groups elementwise nodes of a dataflow graph"
)]
struct Cli {
    /// Input graph (JSON)
    graph: PathBuf,

    /// Fusion configuration (JSON); unset fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// What to write
    #[arg(long, value_enum, default_value_t = Emit::Report)]
    emit: Emit,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Never duplicate a producer for consumers outside its group
    #[arg(long)]
    no_duplication: bool,

    /// Override the member cap per group
    #[arg(long, value_name = "N")]
    max_group: Option<usize>,

    /// Log run milestones
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Load configuration ──
    let mut config = match &cli.config {
        Some(path) => match FusionConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("abfc: error: {}", e);
                std::process::exit(2);
            }
        },
        None => FusionConfig::default(),
    };
    if cli.no_duplication {
        config.allow_duplication = false;
    }
    if let Some(n) = cli.max_group {
        config.max_nodes_per_group = n;
    }
    if let Err(e) = config.validate() {
        eprintln!("abfc: error: {}", e);
        std::process::exit(2);
    }

    // ── Load graph ──
    let text = match std::fs::read_to_string(&cli.graph) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("abfc: error: {}: {}", cli.graph.display(), e);
            std::process::exit(2);
        }
    };
    let mut graph = match Graph::from_json_str(&text) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("abfc: error: {}: {}", cli.graph.display(), e);
            std::process::exit(2);
        }
    };

    // ── Fuse ──
    let provenance = match abfc::report::compute_provenance(&graph, &config) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("abfc: error: {}", e);
            std::process::exit(2);
        }
    };
    let allocator = ScopeAllocator::new();
    let report = match AutomaticBufferFusion::new(config.clone(), &allocator).run(&mut graph) {
        Ok(r) => r.with_provenance(provenance),
        Err(e) => {
            eprintln!("abfc: fusion failed: {}", e);
            std::process::exit(1);
        }
    };

    let cert = abfc::verify::verify_fusion(&graph, &report, &config);
    if !cert.all_pass() {
        for name in cert.failures() {
            eprintln!("abfc: internal error: postcondition {} violated", name);
        }
        std::process::exit(1);
    }

    if cli.verbose {
        for diag in &report.diagnostics {
            eprintln!("abfc: {}", diag);
        }
    }

    // ── Emit ──
    let rendered = match cli.emit {
        Emit::Report => Ok(report.to_string()),
        Emit::Json => report.to_json_pretty(),
        Emit::Dot => Ok(abfc::dot::emit_dot(&graph, Some(&report))),
        Emit::Graph => graph.to_json_pretty(),
    };
    let rendered = match rendered {
        Ok(s) => s,
        Err(e) => {
            eprintln!("abfc: error: {}", e);
            std::process::exit(2);
        }
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, rendered) {
                eprintln!("abfc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", rendered),
    }

    if report.has_errors() {
        std::process::exit(1);
    }
}
