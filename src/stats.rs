//! Index statistics and health overview.
//!
//! Quick summary of what's indexed: document and citation counts, database
//! size, and the last completed scan. Used by `cdx stats` to give
//! confidence that indexing runs are doing what they should.

use anyhow::Result;

use crate::config::Config;
use crate::indexer;
use crate::store::DocumentStore;

pub async fn run_stats(config: &Config) -> Result<()> {
    let store = DocumentStore::open(&config.db.path).await?;
    let stats = store.stats().await?;

    let last_scan = indexer::load_state(&config.db.state_path())?
        .map(|s| s.last_scan_time)
        .unwrap_or_else(|| "never".to_string());

    println!("citedex — Index Stats");
    println!("=====================");
    println!();
    println!("  Database:   {}", config.db.path.display());
    println!("  Size:       {}", format_bytes(stats.size_bytes));
    println!();
    println!("  Documents:  {}", stats.document_count);
    println!("  Citations:  {}", stats.citation_count);
    println!("  Last scan:  {}", last_scan);
    println!();

    store.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
