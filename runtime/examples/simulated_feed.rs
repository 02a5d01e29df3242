//! Simulated outfall - a synthetic SO4 / As / Ni feed against the default permit.
//!
//! Arsenic drifts above its limit for a while, so subscribers see the full
//! WATCH → WARNING → CRITICAL climb and the step-down afterwards.
//!
//! ```bash
//! cargo run -p outfall-runtime --example simulated_feed
//! websocat ws://127.0.0.1:8081/ws/effluent
//! ```

use outfall_runtime::prelude::*;
use std::time::Duration;

/// One sample per species per tick
const TICK: Duration = Duration::from_millis(250);

fn level(species: &str, t: f64) -> f64 {
    let wave = (t / 20.0).sin();
    match species {
        "SO4" => 180.0 + 40.0 * wave,
        // Excursion between t=120 and t=240
        "As" if (120.0..240.0).contains(&t) => 0.018 + 0.002 * wave,
        "As" => 0.004 + 0.001 * wave,
        _ => 0.05 + 0.02 * (t / 7.0).cos(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    outfall_runtime::run(|sender| async move {
        let mut ticker = tokio::time::interval(TICK);
        for step in 0u32..1200 {
            ticker.tick().await;
            let t = f64::from(step);
            for species in ["SO4", "As", "Ni"] {
                sender.push(Reading::new(species, t, level(species, t))?).await?;
            }
        }
        Ok(())
    })
    .await
}
