use anyhow::Result;

use netpolicy_controller::config::Config;
use netpolicy_controller::edges::{read_edge_set, write_frozen_edge_set};

/// Promote newly observed edges into the frozen edge set.
/// Idempotent: if there's nothing new, the frozen set is left untouched.
pub async fn run() -> Result<()> {
    let config = Config::from_env();

    let observed = read_edge_set(&config.observed_path);
    let frozen = read_edge_set(&config.frozen_path);

    let new = observed.difference(&frozen);
    if new.is_empty() {
        println!("Nothing new to promote ({} edges already frozen).", frozen.len());
        return Ok(());
    }

    let promoted = frozen.union(&new);
    write_frozen_edge_set(&config.frozen_path, &promoted)?;

    println!(
        "Promoted {} new edge(s) into {} ({} total).",
        new.len(),
        config.frozen_path,
        promoted.len()
    );

    Ok(())
}
