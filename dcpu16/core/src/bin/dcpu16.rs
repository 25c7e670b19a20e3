use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use dcpu16_core::{
    Clock, Endianness, Lem1802, Processor, ProcessorConfig, Register, Sped3,
};

/// Cycles injected per slice when running without a cycle cap.
const UNBOUNDED_SLICE: u64 = 1_000_000;

#[derive(Parser, Debug)]
#[command(
    name = "dcpu16",
    about = "DCPU-16 emulator with a translating execution core."
)]
struct Args {
    /// Program image to load.
    image: PathBuf,

    /// Load (and dump) images as little-endian words.
    #[arg(short = 'l', long)]
    little_endian: bool,

    /// Run exactly this many cycles then exit; 0 runs unbounded.
    #[arg(long, value_name = "N", default_value_t = 0)]
    cycles: u64,

    /// Throttle execution to the given clock, in kilohertz.
    #[arg(long, value_name = "KHZ")]
    speed: Option<u32>,

    /// Benchmarking mode: no hardware attached; prints elapsed wall time
    /// and the effective clock frequency when emulation completes.
    #[arg(long)]
    bench: bool,

    /// Dump the register file to stdout after execution.
    #[arg(long)]
    test: bool,

    /// Dump the full memory image after execution (requires --dump-file).
    #[arg(long)]
    test_mem: bool,

    /// Where --test-mem writes the memory image.
    #[arg(long, value_name = "PATH")]
    dump_file: Option<PathBuf>,

    /// Attach a SPED-3 suspended particle exciter display.
    #[arg(long)]
    sped: bool,

    /// Attach a LEM1802 low energy monitor.
    #[arg(long)]
    lem: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let order = if args.little_endian {
        Endianness::Little
    } else {
        Endianness::Big
    };

    let mut processor = Processor::new(ProcessorConfig::default());

    let image = match File::open(&args.image) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("dcpu16: cannot open image {}: {err}", args.image.display());
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = processor.machine_mut().memory.load_image(image, order) {
        eprintln!("dcpu16: cannot load image {}: {err}", args.image.display());
        return ExitCode::FAILURE;
    }

    // Benchmarking runs bare: no hardware, nothing to steal cycles.
    if !args.bench {
        let line = processor.interrupt_line();
        processor.attach(Box::new(Clock::new(line)));
        if args.lem {
            processor.attach(Box::new(Lem1802::new()));
        }
        if args.sped {
            processor.attach(Box::new(Sped3::new()));
        }
    }

    let started = Instant::now();
    let run = if let Some(khz) = args.speed {
        let limit = (args.cycles > 0).then_some(args.cycles);
        processor.run_paced(khz, limit)
    } else if args.cycles > 0 {
        processor.inject(args.cycles)
    } else {
        loop {
            if let Err(err) = processor.inject(UNBOUNDED_SLICE) {
                break Err(err);
            }
            if processor.halted() {
                break Ok(());
            }
        }
    };
    if let Err(err) = run {
        eprintln!("dcpu16: execution failed: {err}");
        return ExitCode::FAILURE;
    }

    if args.bench {
        let wall = started.elapsed().as_secs_f64();
        let frequency = processor.elapsed() as f64 / wall.max(f64::EPSILON);
        println!("Time Elapsed: {}", scaled_unit(wall, "s"));
        println!("Clock Frequency: {}", scaled_unit(frequency, "Hz"));
        println!("Elapsed Clocks: {}", processor.elapsed());
    }

    if args.test {
        let info = &processor.machine().info;
        for reg in [
            Register::A,
            Register::B,
            Register::C,
            Register::X,
            Register::Y,
            Register::Z,
            Register::I,
            Register::J,
            Register::Pc,
            Register::Sp,
            Register::Ex,
            Register::Ia,
        ] {
            println!("{:<2} = {:04x}", reg.to_string(), info.get(reg));
        }
    }

    if args.test_mem {
        let Some(path) = args.dump_file.as_ref() else {
            eprintln!("dcpu16: --test-mem requires --dump-file");
            return ExitCode::FAILURE;
        };
        let dump = match File::create(path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("dcpu16: cannot create dump file {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        };
        if let Err(err) = processor.machine().memory.save_image(dump, order) {
            eprintln!("dcpu16: cannot write dump file {}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

/// Human-scaled value with an SI prefix, the way the benchmark report has
/// always printed it.
fn scaled_unit(value: f64, unit: &str) -> String {
    const PREFIXES: [&str; 17] = [
        "y", "z", "a", "f", "p", "n", "u", "m", "", "k", "M", "G", "T", "P", "E", "Z", "Y",
    ];
    let mut scaled = value;
    let mut index = 8usize;
    if scaled > 0.0 {
        while scaled >= 1000.0 && index + 1 < PREFIXES.len() {
            scaled /= 1000.0;
            index += 1;
        }
        while scaled < 1.0 && index > 0 {
            scaled *= 1000.0;
            index -= 1;
        }
    }
    format!("{scaled:.3} {}{unit}", PREFIXES[index])
}
