use heapdump::HeapDump;
use std::env;
use std::fs::File;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <file.heapdump>", args[0]);
        return ExitCode::from(2);
    }

    let path = &args[1];

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening '{}': {}", path, e);
            return ExitCode::FAILURE;
        }
    };

    match HeapDump::parse(file) {
        Ok(dump) => {
            let reachable = dump.reachable();
            println!("Valid heap dump: {}", path);
            println!("  Format version: {}", dump.header.version);
            println!("  Runtime: {}", dump.header.runtime);
            if let Some(label) = &dump.header.label {
                println!("  Label: {}", label);
            }
            println!("  Objects: {}", dump.objects.len());
            println!("  Roots: {}", dump.roots.len());
            println!("  Reachable: {}", reachable.len());
            let unsized_count = dump.objects.values().filter(|o| o.size.is_none()).count();
            if unsized_count > 0 {
                println!("  Without size: {}", unsized_count);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Invalid heap dump '{}': {}", path, e);
            ExitCode::FAILURE
        }
    }
}
