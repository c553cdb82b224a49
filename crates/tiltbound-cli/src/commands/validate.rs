use std::path::Path;

use tiltbound_core::{Result, ingest_file};

pub fn run(input: &str, out_dir: Option<&str>) -> Result<()> {
    let input = Path::new(input);
    let out_dir = match out_dir {
        Some(d) => Path::new(d).to_path_buf(),
        None => input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf),
    };

    let out = ingest_file(input, &out_dir)?;
    let prov = &out.provenance;

    println!("{}", prov.filename);
    println!("  sha256:     {}", prov.content_hash);
    println!(
        "  rows:       {} accepted / {} read ({} rejected)",
        prov.row_count, prov.rows_read, prov.rows_rejected
    );
    if let Some(tr) = &prov.time_range {
        println!("  time range: {} .. {}", tr.start, tr.end);
    }
    for (source, count) in &prov.source_id_distribution {
        println!("  source:     {source} ({count})");
    }
    println!("  validated:  {}", out.validated_path.display());
    println!("  provenance: {}", out.provenance_path.display());
    Ok(())
}
