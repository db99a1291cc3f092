//! Module used for parsing the optional config file. Plain `key=value`
//! lines with `#` comments; the driver looks up `serial.device` and
//! `serial.baud` when neither the command line nor the environment
//! names the scanner.
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead};

#[derive(Debug)]
pub struct Config {
    kv_pairs: HashMap<String, String>,
}

impl Config {
    /// A config with nothing in it; every lookup falls through to the
    /// caller's default.
    pub fn empty() -> Config {
        Config {
            kv_pairs: HashMap::new(),
        }
    }

    /// Parse the file at `path`.
    pub fn from_file(path: &str) -> Result<Config, io::Error> {
        let file = File::open(path)?;
        let mut config = Config::empty();

        let reader = io::BufReader::new(file);
        for line in reader.lines() {
            if let Some((key, value)) = parse_line(&line?) {
                config.kv_pairs.insert(key, value);
            }
        }

        Ok(config)
    }

    /// Return the value for a key if it exists.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.kv_pairs.get(key).map(|v| v.as_str())
    }

    /// Return a numeric value for a key. A value that does not parse is
    /// treated as absent.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(at) => &line[..at],
        None => line,
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = strip_comment(line);
    let sep = line.find('=')?;
    let key = line[..sep].trim();
    let value = line[sep + 1..].trim();
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
