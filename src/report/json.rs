//! JSON report export

use crate::error::Result;
use crate::models::Vulnerability;
use std::path::Path;
use tracing::info;

/// Exports findings as a pretty-printed JSON array
pub fn export(vulnerabilities: &[Vulnerability], output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(vulnerabilities)?;
    std::fs::write(output_path, json)?;
    info!("JSON report saved to {}", output_path.display());
    Ok(())
}

/// Loads findings from a JSON report
pub fn load(input_path: &Path) -> Result<Vec<Vulnerability>> {
    let content = std::fs::read_to_string(input_path)?;
    let vulnerabilities: Vec<Vulnerability> = serde_json::from_str(&content)?;
    Ok(vulnerabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    #[test]
    fn test_export_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let findings = vec![
            Vulnerability::new("Reflected XSS", Severity::High, "xss", "http://site.test/?q=1")
                .with_param("q", "<script>")
                .with_match_string("<script>"),
        ];
        export(&findings, &path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, findings[0].id);
        assert_eq!(loaded[0].tested_param, "q");
        assert_eq!(loaded[0].level, Severity::High);
    }
}
