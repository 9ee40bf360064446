use anyhow::Context;
use tessel_cpu::{utils::parse_u64_with_prefix, ArchIf, Config};
use tessel_vm::{
    toy::{ToyCore, ToyGenerator},
    Vm,
};

/// RAM mapped when `TESSEL_RAM_SIZE` is not set.
const DEFAULT_RAM_SIZE: u64 = 0x10_0000;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("TESSEL_LOG"))
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{e:?}");
            std::process::exit(-1);
        }
    }
}

fn env_u64(name: &str) -> anyhow::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => parse_u64_with_prefix(&value)
            .map(Some)
            .ok_or_else(|| anyhow::format_err!("invalid value for {name}: {value:?}")),
        Err(_) => Ok(None),
    }
}

fn run() -> anyhow::Result<i32> {
    let path = std::env::args().nth(1).ok_or_else(|| anyhow::format_err!("Expected image"))?;
    let image = std::fs::read(&path).with_context(|| format!("failed to read: {path}"))?;

    let config = Config::from_env()?;
    let load_addr = env_u64("TESSEL_LOAD_ADDR")?.unwrap_or(0x1000);
    let icount_limit = env_u64("TESSEL_ICOUNT_LIMIT")?;
    let ram_size = env_u64("TESSEL_RAM_SIZE")?.unwrap_or(DEFAULT_RAM_SIZE);

    let mut core = ToyCore::new(load_addr, ram_size.try_into()?);
    core.load(load_addr, &image).with_context(|| format!("{path} does not fit in RAM"))?;
    core.trap_vector = env_u64("TESSEL_TRAP_VECTOR")?.unwrap_or(load_addr);
    core.reset(Some(load_addr));

    let mut vm = Vm::new(Box::new(core), ToyGenerator, config)?;
    let exit = vm.run(icount_limit)?;

    if let Some(il) = &vm.jit.il_dump {
        eprintln!("{il}");
    }
    if let Some(path) = std::env::var_os("TESSEL_JIT_MAPPING") {
        vm.jit.dump_jit_mapping(path.as_ref()).context("failed to write JIT mapping")?;
    }

    if let Some(summary) = &vm.last_run {
        println!("{summary}");
    }
    println!("{exit:?} (icount = {})", vm.core.instruction_count());
    Ok(exit.exit_code())
}
