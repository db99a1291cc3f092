use scanner::Scanner;
use std::error::Error;

pub mod channel;
pub mod config;
pub mod log;
pub mod packet;
pub mod scanner;
pub mod serialport;

/// Pick the device and line rate: explicit argument first, then the
/// ZEBRA_SCANNER environment variable, then the config file, then the
/// stock defaults.
pub fn resolve_device(arg: Option<&str>, config: &config::Config) -> (String, serialport::BaudRate) {
    let device = match arg {
        Some(dev) => dev.to_string(),
        None => match std::env::var("ZEBRA_SCANNER") {
            Ok(dev) => dev,
            Err(_) => match config.get("serial.device") {
                Some(dev) => dev.to_string(),
                None => scanner::default_device(),
            },
        },
    };
    let baud = config
        .get_u32("serial.baud")
        .and_then(serialport::baud_from_u32)
        .unwrap_or(scanner::DEFAULT_BAUD);
    (device, baud)
}

/// Open the scanner, read one barcode, print it, close.
pub fn run(config: &config::Config, device: Option<&str>) -> Result<(), Box<dyn Error>> {
    let (device, baud) = resolve_device(device, config);
    log::info(&format!("scanner: {}", device));

    let mut scanner = Scanner::open(&device, baud)?;
    let mut buff = [0u8; 4000];
    let result = scanner.read_barcode(&mut buff);
    let closed = scanner.close();
    let nbytes = result?;
    closed?;

    println!(
        "Barcode({}):\n{}",
        nbytes,
        String::from_utf8_lossy(&buff[..nbytes])
    );
    Ok(())
}
