use strata::logging::LogConfig;
use strata::Database;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Info level, pretty output to stdout
    let _guard = LogConfig::info().init()?;

    println!("=== Strata Snapshot Demo ===\n");

    let dir = tempfile::tempdir()?;
    let db = Database::open(dir.path())?;

    println!("1. Writing a, a, b...");
    db.put(b"a", b"1")?;
    db.put(b"a", b"2")?;
    db.put(b"b", b"3")?;

    println!("2. Taking a snapshot, then deleting a...");
    let snapshot = db.snapshot();
    db.delete(b"a")?;

    println!("3. Reading both views:");
    println!("   latest   a = {:?}", db.get(b"a")?);
    println!("   snapshot a = {:?}", db.get_at(b"a", &snapshot)?.map(String::from_utf8));

    println!("\n4. Compacting; the snapshot still pins the old version...");
    db.compact()?;
    for entry in db.iter_at(&snapshot) {
        let (key, value) = entry?;
        println!(
            "   {} => {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
    }

    if let Some(stats) = db.property("strata.stats") {
        println!("\n{}", stats);
    }

    snapshot.release();
    db.close()?;
    println!("=== Demo Complete ===");
    Ok(())
}
