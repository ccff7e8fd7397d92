use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::info;

use tensorplan::{
    graph::{BinaryOpcode, DataType, Graph, OpType, TensorId, UnaryOpcode},
    runtime::CpuRuntime,
};

/// Builds a synthetic network, then optimizes and plans its memory
#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Number of layers in the network
    #[clap(short, long, default_value_t = 4)]
    depth: usize,

    /// Leading batch dimension of every tensor
    #[clap(short, long, default_value_t = 1)]
    batch: usize,

    /// Feature width of every layer
    #[clap(short, long, default_value_t = 64)]
    width: usize,

    /// Activation applied after each layer
    #[clap(short, long, value_enum, default_value_t = Activation::Relu)]
    activation: Activation,

    /// Allocator alignment, in bytes
    #[clap(long, default_value_t = tensorplan::alloc::DEFAULT_ALIGNMENT)]
    alignment: usize,

    /// Skip graph optimization
    #[clap(long)]
    no_optimize: bool,

    /// Print the graph dump after planning
    #[clap(short, long)]
    print: bool,

    /// Name of a `.dot` file to write
    #[clap(short, long)]
    out: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy)]
enum Activation {
    Relu,
    Sigmoid,
    Tanh,
}

impl From<Activation> for UnaryOpcode {
    fn from(a: Activation) -> Self {
        match a {
            Activation::Relu => UnaryOpcode::Relu,
            Activation::Sigmoid => UnaryOpcode::Sigmoid,
            Activation::Tanh => UnaryOpcode::Tanh,
        }
    }
}

/// Builds `depth` layers of `act(x^T^T @ w^T + x)`
///
/// The doubled transpose and the transposed weight are both redundant, which
/// gives the optimizer something to do.
fn build(args: &Args) -> Result<(Graph, TensorId)> {
    if args.depth == 0 {
        bail!("network must have at least one layer");
    }
    let mut g = Graph::with_alignment(CpuRuntime::shared(), args.alignment)?;
    let (b, n) = (args.batch, args.width);
    let mut x = g.add_tensor(vec![b, n, n], DataType::Float32);
    for _ in 0..args.depth {
        let w = g.add_tensor(vec![b, n, n], DataType::Float32);
        let t = g.add_transpose(x, vec![0, 2, 1])?;
        let t = g.add_transpose(out(&g, t)?, vec![0, 2, 1])?;
        let wt = g.add_transpose(w, vec![0, 2, 1])?;
        let m = g.add_matmul(out(&g, t)?, out(&g, wt)?, false, false)?;
        let s = g.add_binary(BinaryOpcode::Add, out(&g, m)?, x)?;
        let a = g.add_unary(args.activation.into(), out(&g, s)?)?;
        x = out(&g, a)?;
    }
    Ok((g, x))
}

fn out(g: &Graph, op: tensorplan::graph::OpId) -> Result<TensorId> {
    match g.output(op) {
        Some(t) => Ok(t),
        None => bail!("operator {op:?} has no single output"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();
    let args = Args::parse();

    let start = Instant::now();
    let (mut g, result) = build(&args)?;
    info!(
        "Built {} operators and {} tensors in {:?}",
        g.op_count(),
        g.tensor_count(),
        start.elapsed()
    );

    if !args.no_optimize {
        let start = Instant::now();
        let n = g.optimize();
        info!("Applied {n} rewrites in {:?}", start.elapsed());
    }
    g.validate()?;
    g.shape_infer()?;

    let start = Instant::now();
    g.data_malloc()?;
    info!("Planned memory in {:?}", start.elapsed());

    let mut counts = std::collections::BTreeMap::<OpType, usize>::new();
    for op in g.operators() {
        if let Some(o) = g.operator(op) {
            *counts.entry(o.op_type()).or_default() += 1;
        }
    }
    for (k, v) in counts {
        info!("  {k}: {v}");
    }
    if let Some(t) = g.tensor(result) {
        info!("Result shape: {:?} ({})", t.shape(), t.dtype());
    }
    let stats = g.allocator().info();
    info!("Arena: {} bytes used, {} bytes peak", stats.used, stats.peak);

    if args.print {
        print!("{g}");
    }
    if let Some(path) = args.out {
        std::fs::write(path, g.dot())?;
    }
    Ok(())
}
