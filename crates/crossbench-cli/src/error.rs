use colored::Colorize;

const SUGGESTION_HEADER: &str = "Suggestion:";

fn suggestions_for_message(msg: &str) -> Vec<Vec<String>> {
    let lower = msg.to_lowercase();
    let mut blocks = Vec::new();

    if lower.contains("browser binary not found") {
        blocks.push(vec![
            "Pass an absolute binary path:".to_string(),
            format!("{} crossbench --browser /path/to/chrome <URL>", "$".dimmed()),
        ]);
    }

    if lower.contains("exists already") {
        blocks.push(vec![
            "Pick a fresh output directory:".to_string(),
            format!("{} crossbench -o results/new-run <URL>", "$".dimmed()),
        ]);
    }

    if lower.contains("not compatible with browser") {
        blocks.push(vec![
            "Attach the probe only to matching browsers or drop the \
             incompatible browser variant."
                .to_string(),
        ]);
    }

    if lower.contains("runs failed") || lower.contains("captured error") {
        blocks.push(vec![
            "Inspect the first failed run directory logged above.".to_string(),
            "Rerun with --throw to fail fast and -vv for verbose logging.".to_string(),
        ]);
    }

    blocks
}

pub fn report(err: &dyn std::fmt::Display) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    for lines in suggestions_for_message(&err.to_string()) {
        eprintln!("\n{}", SUGGESTION_HEADER.yellow().bold());
        for line in lines {
            eprintln!("  {line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::suggestions_for_message;

    fn joined(msg: &str) -> String {
        suggestions_for_message(msg)
            .iter()
            .flat_map(|block| block.iter())
            .cloned()
            .collect::<Vec<String>>()
            .join("\n")
    }

    #[test]
    fn suggests_browser_path() {
        assert!(joined("Browser binary not found: chrome").contains("--browser"));
    }

    #[test]
    fn suggests_fresh_out_dir() {
        assert!(joined("out_dir=results/test exists already").contains("-o results"));
    }

    #[test]
    fn suggests_debug_flags_for_failed_runs() {
        assert!(joined("Runs Failed: 1/3 runs failed.").contains("--throw"));
    }

    #[test]
    fn no_suggestion_for_unrelated_error() {
        assert!(suggestions_for_message("unexpected parse error").is_empty());
    }
}
