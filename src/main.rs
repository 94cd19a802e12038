use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};

use slipserve::http::HttpServer;
use slipserve::serial::Tty;
use slipserve::tcp::State;
use slipserve::{logger, Stack};

const HTTP_PORT: u16 = 80;
const DEFAULT_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
const DEFAULT_DEVICE: &str = "/dev/ttyS0";

struct Args {
    addr: Ipv4Addr,
    root: PathBuf,
    allow_put: bool,
    device: String,
}

fn usage() -> ! {
    eprintln!("Usage: slipserve [ip] [path] [-w] [-d device]");
    exit(1);
}

fn parse_args() -> Args {
    let mut args = Args {
        addr: DEFAULT_ADDR,
        root: PathBuf::from("."),
        allow_put: false,
        device: DEFAULT_DEVICE.to_string(),
    };

    let mut positional = 0;
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-w" => args.allow_put = true,
            "-d" => match iter.next() {
                Some(device) => args.device = device,
                None => usage(),
            },
            _ => {
                positional += 1;
                match positional {
                    1 => match arg.parse() {
                        Ok(addr) => args.addr = addr,
                        Err(_) => {
                            eprintln!("Invalid IP: {arg}");
                            usage();
                        }
                    },
                    2 => args.root = PathBuf::from(arg),
                    _ => usage(),
                }
            }
        }
    }

    args
}

fn main() {
    logger::init();

    let args = parse_args();

    let serial = match Tty::open(&args.device) {
        Ok(serial) => serial,
        Err(err) => {
            error!("{}: {err}", args.device);
            exit(1);
        }
    };

    let mut stack = Stack::new(serial, args.addr);
    let mut app = HttpServer::new(args.root.clone(), args.allow_put);

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::Release))
            .expect("installing the shutdown handler");
    }

    info!(
        "serving {} on {}:{HTTP_PORT} via {}",
        args.root.display(),
        args.addr,
        args.device
    );
    if args.allow_put {
        info!("put uploads enabled");
    }

    stack.listen(HTTP_PORT);

    while running.load(Ordering::Acquire) {
        stack.poll(&mut app);
        thread::sleep(Duration::from_millis(1));
    }

    if stack.state() == State::Established {
        stack.close();
    }

    info!("bye");
}
