use ssi_ctrl::{config, log, resolve_device, scanner};
use std::env;
use std::process;

const CONFIG_PATH: &str = "/etc/ssi_ctrl.conf";

const USAGE: &str = "\
Drive a Zebra/Symbol SSI barcode scanner.

Usage: ssi_ctrl scan [<dev>]
       ssi_ctrl setup [<dev>] [auto|manual]

auto   trigger on presence (default)
manual trigger from the host

The device defaults to $ZEBRA_SCANNER, then serial.device in
/etc/ssi_ctrl.conf, then /dev/ttyACM0.";

fn main() {
    let args: Vec<String> = env::args().collect();
    let cfg = config::Config::from_file(CONFIG_PATH).unwrap_or_else(|_| config::Config::empty());

    let code = match args.get(1).map(|s| s.as_str()) {
        Some("scan") => scan(&cfg, args.get(2).map(|s| s.as_str())),
        Some("setup") => setup(&cfg, &args[2..]),
        _ => {
            eprintln!("{}", USAGE);
            1
        }
    };
    process::exit(code);
}

fn scan(cfg: &config::Config, device: Option<&str>) -> i32 {
    match ssi_ctrl::run(cfg, device) {
        Ok(_) => 0,
        Err(e) => {
            log::error(&format!("scan failed: {}", e));
            2
        }
    }
}

fn setup(cfg: &config::Config, args: &[String]) -> i32 {
    let mut device: Option<&str> = None;
    let mut mode = scanner::TriggerMode::Auto;
    for arg in args {
        match arg.as_str() {
            "auto" => mode = scanner::TriggerMode::Auto,
            "manual" => mode = scanner::TriggerMode::Manual,
            dev if device.is_none() => device = Some(dev),
            _ => {
                eprintln!("{}", USAGE);
                return 1;
            }
        }
    }
    let (device, baud) = resolve_device(device, cfg);
    log::info(&format!("configuring {} ({:?} trigger)", device, mode));
    match scanner::setup(&device, baud, mode) {
        Ok(_) => {
            println!("Configure SSI parameters...OK");
            0
        }
        Err(e) => {
            log::error(&format!("configuring the scanner failed: {}", e));
            2
        }
    }
}
