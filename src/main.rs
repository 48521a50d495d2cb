use anyhow::{Context, Result};
use cholesky_eri::prelude::*;
use cholesky_eri::*;
use clap::{Args, Parser, Subcommand};
use libcint::prelude::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct CliParser {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CliArgsCD {
    #[clap(short, long = "mol", help = "Path to the json file containing molecular data")]
    mol_file: String,

    #[clap(long = "mo-coeff", help = "Path to the npy file of AO-to-MO coefficients (nao, nmo)")]
    mo_coeff_file: PathBuf,

    #[clap(short, long = "out", help = "Path of the npy file receiving the MO cholesky vectors")]
    out_file: PathBuf,

    #[clap(long = "nocc-alpha", help = "Number of occupied alpha orbitals")]
    n_occ_alpha: usize,

    #[clap(long = "nocc-beta", help = "Number of occupied beta orbitals (defaults to alpha)")]
    n_occ_beta: Option<usize>,

    #[clap(long = "frozen-core", default_value_t = 0)]
    n_frozen_core: usize,

    #[clap(long = "frozen-virtual", default_value_t = 0)]
    n_frozen_virtual: usize,

    #[clap(long = "mso", help = "Coefficients are spin-orbital: occ alpha, occ beta, virt alpha, virt beta")]
    is_mso: bool,

    #[clap(long, default_value_t = 1.0e-5)]
    diagtol: f64,

    #[clap(long = "max-cvecs-factor", default_value_t = 12)]
    max_cvecs_factor: usize,

    #[clap(long = "ao-tilesize", default_value_t = 30)]
    ao_tilesize: usize,

    #[clap(long, help = "Restart from a checkpoint if one exists")]
    readt: bool,

    #[clap(long, help = "Write checkpoints")]
    writet: bool,

    #[clap(long = "scratch-dir", default_value = ".")]
    scratch_dir: PathBuf,

    #[clap(long = "prefix", default_value = "output")]
    output_file_prefix: String,

    #[clap(long, default_value = "sto-3g", help = "Basis name, used in checkpoint paths")]
    basis: String,

    #[clap(long = "scf-type", default_value = "restricted")]
    scf_type: String,

    #[clap(long = "max-memory", help = "Memory ceiling in GiB")]
    max_memory_gib: Option<f64>,

    #[clap(long = "local-buffer", help = "Update owned blocks in place instead of by get/put")]
    local_buffer: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[clap(name = "cd", about = "Cholesky-decompose the ERI and transform the vectors to the MO basis")]
    Cd(CliArgsCD),
}

fn run_cd(args: CliArgsCD) -> Result<()> {
    let time = std::time::Instant::now();
    #[cfg(feature = "mpi")]
    let universe = mpi::initialize().context("MPI was already initialized")?;
    #[cfg(feature = "mpi")]
    let group = MpiGroup::new(universe.world());
    #[cfg(not(feature = "mpi"))]
    let group = SerialGroup;

    let rank0 = group.rank() == 0;
    let cint_data = CInt::from_json(&args.mol_file);
    let lcao = util::tensor_from_npy(&args.mo_coeff_file)?;
    let nao = cint_data.nao();

    let opts = CDOptionsBuilder::default()
        .diagtol(args.diagtol)
        .max_cvecs_factor(args.max_cvecs_factor)
        .ao_tilesize(args.ao_tilesize)
        .readt(args.readt)
        .writet(args.writet)
        .scratch_dir(args.scratch_dir)
        .output_file_prefix(args.output_file_prefix)
        .basis(args.basis)
        .scf_type(args.scf_type)
        .max_memory_gib(args.max_memory_gib)
        .access(if args.local_buffer { AccessStrategy::LocalBuffer } else { AccessStrategy::BlockTransfer })
        .build()?;

    let mut sys = SystemData::new(nao, args.n_occ_alpha, args.n_occ_beta.unwrap_or(args.n_occ_alpha))?
        .with_frozen(args.n_frozen_core, args.n_frozen_virtual)?;

    let ovlp = util::intor_row_major(&cint_data, "int1e_ovlp");
    let layout = ShellLayout::new(cint_data.shell_offsets())?;
    let pairs = ShellPairList::from_overlap(&ovlp, &layout, opts.screening_threshold)?;
    if rank0 {
        log::info!("Significant shell pairs: {} of {}", pairs.npairs(), layout.nbas() * (layout.nbas() + 1) / 2);
    }

    let results = compute_cholesky_mo(&mut sys, &cint_data, &pairs, lcao, &opts, &group, args.is_mso)?;
    if rank0 {
        util::tensor_to_npy(&args.out_file, &results.chol_mo.tensor)
            .with_context(|| format!("writing cholesky vectors to {}", args.out_file.display()))?;
        log::info!("Cholesky vectors: {}, nmo: {}", results.count, sys.nmo);
        log::info!("Elapsed time for CD: {:.2?}", time.elapsed());
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliParser::parse();
    match args.command {
        Command::Cd(cli_args) => run_cd(cli_args),
    }
}
