use indicatif::{ProgressBar, ProgressStyle};

pub(crate) fn create_progress_bar(total_steps: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total_steps);

    let style = ProgressStyle::default_bar()
        .template(
            "[{spinner:.green} {elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(msg.to_owned());

    pb
}

/// Parse `0xE2`, `E2` or `e2` as one byte
pub(crate) fn parse_hex_byte(value: &str) -> Result<u8, String> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("{:?} is not a hex byte: {}", value, e))
}

pub(crate) fn format_signature(signature: &[u8; 3]) -> String {
    signature
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}
