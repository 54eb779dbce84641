//! relift CLI - static PE rewriter.
//!
//! Loads a PE image, lifts it into symbolic blocks and re-emits it into
//! freshly allocated memory regions. `inspect` stops after disassembly and
//! prints the discovered structure; `rewrite` runs the full pipeline and,
//! on Windows, can execute the rewritten entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use anyhow::Context;
use bytesize::ByteSize;
use indicatif::{ProgressBar, ProgressStyle};
use relift::{DisasmConfig, InstrCategory, OwnedRegion, Session};

/// Static x86-64 PE rewriter.
#[derive(Parser)]
#[command(name = "relift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Disassemble an image and print its block and symbol summary
    Inspect {
        /// Input PE file
        image: PathBuf,

        /// Dump every basic block with its instruction bytes
        #[arg(long)]
        blocks: bool,

        /// Keep INT3/INT1 padding interior to blocks instead of ending them
        #[arg(long)]
        int3_padding: bool,
    },

    /// Rewrite an image into freshly allocated memory regions
    Rewrite {
        /// Input PE file
        image: PathBuf,

        /// Code region size in bytes (default: estimated from the image)
        #[arg(long)]
        code_size: Option<usize>,

        /// Data region size in bytes (default: estimated from the image)
        #[arg(long)]
        data_size: Option<usize>,

        /// Call the rewritten entry point after emission (Windows only)
        #[arg(long)]
        execute: bool,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect {
            image,
            blocks,
            int3_padding,
        } => inspect(&image, blocks, int3_padding),

        Commands::Rewrite {
            image,
            code_size,
            data_size,
            execute,
        } => rewrite(&image, code_size, data_size, execute),
    }
}

fn phase_spinner(msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .expect("valid template"),
    );
    pb.set_message(msg);
    pb
}

fn load_session(image: &PathBuf, config: DisasmConfig) -> anyhow::Result<Session> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("reading {}", image.display()))?;
    println!(
        "Loaded {} ({})",
        image.display(),
        ByteSize::b(bytes.len() as u64)
    );
    Ok(Session::with_config(bytes, config)?)
}

fn inspect(image: &PathBuf, dump_blocks: bool, int3_padding: bool) -> anyhow::Result<()> {
    let config = DisasmConfig {
        int3_terminates: !int3_padding,
    };
    let mut session = load_session(image, config)?;

    let pb = phase_spinner("Disassembling");
    session.disassemble()?;
    pb.finish_and_clear();

    let pe = session.pe();
    println!("Entry point:      0x{:X}", pe.entry_point);
    println!("Sections:         {}", pe.sections.len());
    println!("Pdata functions:  {}", pe.functions.len());

    let store = session.blocks();
    let instruction_count: usize = store
        .code_blocks()
        .map(|b| b.instructions.len())
        .sum();
    println!(
        "Basic blocks:     {} ({} instructions)",
        store.code_len(),
        instruction_count
    );
    println!("Data blocks:      {}", store.data_len());
    println!("Symbols:          {}", session.symbols().len());

    for module in &pe.imports {
        println!("Import module {} ({} routines)", module.name, module.routines.len());
        for routine in &module.routines {
            println!("    {:<40} IAT slot 0x{:X}", routine.name, routine.iat_rva);
        }
    }

    for diagnostic in session.diagnostics() {
        println!("warning: {diagnostic}");
    }

    if dump_blocks {
        for block in store.code_blocks() {
            println!("\n{} @ RVA 0x{:X}:", block.id, block.original_rva);
            for instr in &block.instructions {
                let bytes = instr
                    .bytes
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                let rva = instr
                    .original_rva
                    .map(|r| format!("0x{r:X}"))
                    .unwrap_or_else(|| "<synth>".to_string());
                match instr.target {
                    Some(relift::block::Target::Sym { symbol, addend }) if addend != 0 => {
                        println!("  {rva:>10}: {bytes:<32} -> {symbol}+0x{addend:x}")
                    }
                    Some(relift::block::Target::Sym { symbol, .. }) => {
                        println!("  {rva:>10}: {bytes:<32} -> {symbol}")
                    }
                    _ => println!("  {rva:>10}: {bytes}"),
                }
            }
        }
    }

    Ok(())
}

fn rewrite(
    image: &PathBuf,
    code_size: Option<usize>,
    data_size: Option<usize>,
    execute: bool,
) -> anyhow::Result<()> {
    let mut session = load_session(image, DisasmConfig::default())?;

    let pb = phase_spinner("Disassembling");
    session.disassemble()?;
    pb.finish_and_clear();

    // Size the regions from the lifted image unless overridden: the block
    // estimates are already pessimistic, data blocks get alignment slack.
    let code_size = code_size.unwrap_or_else(|| {
        session
            .blocks()
            .code_blocks()
            .map(|b| b.estimated_size())
            .sum::<usize>()
            + 0x1000
    });
    let data_size = data_size.unwrap_or_else(|| {
        session
            .blocks()
            .data_blocks()
            .map(|d| d.extent() as usize + 8)
            .sum::<usize>()
            + 0x1000
    });

    let code_region = OwnedRegion::alloc_code(code_size)?;
    let data_region = OwnedRegion::alloc_data(data_size)?;
    println!(
        "Regions: code {} @ 0x{:X}, data {} @ 0x{:X}",
        ByteSize::b(code_size as u64),
        code_region.base(),
        ByteSize::b(data_size as u64),
        data_region.base()
    );

    // SAFETY: the regions outlive the session and nothing else touches them.
    unsafe {
        session.add_code_region(code_region.base(), code_region.size());
        session.add_data_region(data_region.base(), data_region.size());
    }

    let pb = phase_spinner("Emitting");
    let entry = session.emit(default_resolver())?;
    pb.finish_and_clear();

    let store = session.blocks();
    let code_used: u64 = store
        .code_blocks()
        .filter_map(|b| b.final_size)
        .map(u64::from)
        .sum();
    let relative_instrs = store
        .code_blocks()
        .flat_map(|b| b.instructions.iter())
        .filter(|i| i.category != InstrCategory::Normal)
        .count();

    println!("Rewrite complete:");
    println!("  entry point     0x{entry:X}");
    println!(
        "  code            {} across {} blocks",
        ByteSize::b(code_used),
        store.code_len()
    );
    println!(
        "  data            {} blocks, {} imports bound",
        store.data_len(),
        session.symbols().import_slots().len()
    );
    println!("  control flow    {relative_instrs} re-encoded instructions");

    for diagnostic in session.diagnostics() {
        println!("warning: {diagnostic}");
    }

    if execute {
        run_entry(entry)?;
    }

    Ok(())
}

/// Resolver used by `rewrite`: the real loader on Windows, a stub elsewhere.
#[cfg(target_os = "windows")]
fn default_resolver() -> impl FnMut(&str, &str) -> Option<u64> {
    use windows::core::PCSTR;
    use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

    |module: &str, routine: &str| {
        let module_c = std::ffi::CString::new(module).ok()?;
        let handle = unsafe { LoadLibraryA(PCSTR(module_c.as_ptr() as *const u8)) }.ok()?;

        let proc = if let Some(ordinal) = routine.strip_prefix('#') {
            let ordinal: u16 = ordinal.parse().ok()?;
            unsafe { GetProcAddress(handle, PCSTR(ordinal as usize as *const u8)) }
        } else {
            let routine_c = std::ffi::CString::new(routine).ok()?;
            unsafe { GetProcAddress(handle, PCSTR(routine_c.as_ptr() as *const u8)) }
        };
        proc.map(|f| f as usize as u64)
    }
}

#[cfg(not(target_os = "windows"))]
fn default_resolver() -> impl FnMut(&str, &str) -> Option<u64> {
    tracing::warn!("no loader on this platform, binding imports to stub addresses");
    let mut next = 0x7FFE_0000_0000u64;
    move |_module: &str, _routine: &str| {
        next += 8;
        Some(next)
    }
}

#[cfg(target_os = "windows")]
fn run_entry(entry: u64) -> anyhow::Result<()> {
    println!("Calling rewritten entry point at 0x{entry:X}");
    let result = unsafe {
        let f: extern "system" fn() -> u64 = std::mem::transmute(entry as usize);
        f()
    };
    println!("Entry point returned 0x{result:X}");
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_entry(_entry: u64) -> anyhow::Result<()> {
    anyhow::bail!("--execute requires Windows (regions are not executable here)")
}
