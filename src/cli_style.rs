//! Terminal output helpers for the cutie-tts binary

use crate::tts::{EngineInfo, StageKind, SynthesisOutcome};
use owo_colors::OwoColorize;

/// Check if terminal supports colors
pub fn supports_color() -> bool {
    supports_color::on(supports_color::Stream::Stdout).is_some()
}

/// Print a section header
pub fn print_section(title: &str) {
    if supports_color() {
        println!("\n{}", "━".repeat(60).bright_black());
        println!("  {}", title.bright_cyan().bold());
        println!("{}", "━".repeat(60).bright_black());
    } else {
        println!("\n{}", "━".repeat(60));
        println!("  {}", title);
        println!("{}", "━".repeat(60));
    }
}

pub fn print_success(message: &str) {
    if supports_color() {
        println!("{} {}", "✓".bright_green().bold(), message.green());
    } else {
        println!("[OK] {}", message);
    }
}

pub fn print_error(message: &str) {
    if supports_color() {
        eprintln!("{} {}", "✗".bright_red().bold(), message.red());
    } else {
        eprintln!("[ERR] {}", message);
    }
}

pub fn print_warning(message: &str) {
    if supports_color() {
        println!("{} {}", "⚠".bright_yellow().bold(), message.yellow());
    } else {
        println!("[WARN] {}", message);
    }
}

pub fn print_info(message: &str) {
    if supports_color() {
        println!("{} {}", "ℹ".bright_blue().bold(), message.bright_white());
    } else {
        println!("[INFO] {}", message);
    }
}

/// Print aligned `label: value` rows
pub fn print_kv(items: &[(&str, String)]) {
    let width = items.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    for (label, value) in items {
        let padded = format!("{label:>width$}");
        if supports_color() {
            println!("  {}  {}", padded.bright_blue(), value);
        } else {
            println!("  {}  {}", padded, value);
        }
    }
}

fn yes_no(flag: bool) -> String {
    let label = if flag { "available" } else { "off" };
    label.to_string()
}

/// Render `cutie-tts info`
pub fn print_engine_info(info: &EngineInfo) {
    print_section("Engine");
    let stages: Vec<String> = info.stages.iter().map(StageKind::to_string).collect();
    print_kv(&[
        ("version", info.version.clone()),
        ("sample rate", format!("{} Hz", info.sample_rate)),
        ("speakers", info.speakers.to_string()),
        ("stages", stages.join(" → ")),
    ]);

    print_section("Capabilities");
    print_kv(&[
        ("neural", yes_no(info.capabilities.has_neural)),
        ("local voice", yes_no(info.capabilities.has_local_voice)),
        ("cloud voice", yes_no(info.capabilities.has_cloud_voice)),
    ]);
    if let Some(model) = &info.model {
        print_info(&format!("Model: {model}"));
    }
    if let Some(voice) = &info.local_voice {
        print_info(&format!("Host voice: {voice}"));
    }
}

/// Render the result of `cutie-tts generate`
pub fn print_outcome(outcome: &SynthesisOutcome) {
    for failure in &outcome.failures {
        print_warning(&format!("{} stage failed: {}", failure.stage, failure.error));
    }
    let artifact = &outcome.artifact;
    if outcome.total_failure {
        print_error(&format!(
            "All synthesis methods failed; wrote {:.1}s of silence to {}",
            artifact.duration_secs,
            artifact.path.display()
        ));
        return;
    }
    print_success(&format!(
        "Wrote {:.2}s of audio to {}",
        artifact.duration_secs,
        artifact.path.display()
    ));
    print_kv(&[
        ("stage", artifact.stage.to_string()),
        ("samples", artifact.num_samples.to_string()),
        ("bytes", artifact.bytes.to_string()),
    ]);
}
