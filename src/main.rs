use std::env;
use std::fs::File;
use std::io::{self, prelude::*};
use std::path::PathBuf;
use std::process::exit;

use glowworm::host::Host;
use glowworm::interpreter::Interpreter;
use glowworm::memory::ImageMemory;
use glowworm::output::{ChannelId, ChannelOutput};

/// Plain terminal host: MAIN goes to stdout, other channels are logged,
/// input comes from stdin.
struct TerminalHost;

impl Host for TerminalHost {
    fn line_wanted(&mut self) -> Option<String> {
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) => None, // EOF cancels
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(_) => None,
        }
    }

    fn key_wanted(&mut self) -> Option<char> {
        self.line_wanted().and_then(|line| line.chars().next())
    }

    fn output_ready(&mut self, channels: ChannelOutput) {
        for (id, text) in channels {
            if id == ChannelId::MAIN {
                print!("{text}");
                io::stdout().flush().ok();
            } else {
                log::debug!("[{id}] {text}");
            }
        }
    }

    fn save_requested(&mut self) -> Option<Box<dyn Write>> {
        File::create("game.glksave")
            .map(|f| Box::new(f) as Box<dyn Write>)
            .map_err(|e| eprintln!("cannot create save file: {e}"))
            .ok()
    }

    fn load_requested(&mut self) -> Option<Box<dyn Read>> {
        File::open("game.glksave")
            .map(|f| Box::new(f) as Box<dyn Read>)
            .map_err(|e| eprintln!("cannot open save file: {e}"))
            .ok()
    }
}

fn main() -> io::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: glowworm <game.ulx>");
        exit(2);
    }

    let path = PathBuf::from(&args[1]);
    if !path.exists() {
        eprintln!("Error: game file not found: {:?}", path);
        exit(2);
    }

    let mut file = File::open(&path)?;
    let mut image_bytes = Vec::new();
    file.read_to_end(&mut image_bytes)?;

    let image = match ImageMemory::load(image_bytes) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("Cannot load {:?}: {e}", path);
            exit(1);
        }
    };
    log::info!("loaded {:?}: {}", path, image.header());

    let mut terp = match Interpreter::new(image, Box::new(TerminalHost)) {
        Ok(terp) => terp,
        Err(e) => {
            eprintln!("Cannot start {:?}: {e}", path);
            exit(1);
        }
    };

    match terp.run() {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("Execution error: {e}");
            exit(1);
        }
    }
}
