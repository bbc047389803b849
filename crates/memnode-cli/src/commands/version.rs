use memnode_core::version::{version_string, SCHEMA_VERSION};
use memnode_core::VERSION;
use miette::Result;

pub fn run(json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "version": VERSION,
                "schema_version": SCHEMA_VERSION,
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            })
        );
    } else {
        println!("{}", version_string());
    }
    Ok(())
}
