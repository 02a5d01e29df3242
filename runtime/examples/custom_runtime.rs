//! Power-user example - custom ports, an inline permit and a named relay.
//!
//! ```bash
//! cargo run -p outfall-runtime --example custom_runtime
//! ```

use outfall_runtime::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let permit = Permit::new()
        .with_rule(
            "Cu",
            PermitRule::new(0.5, 600.0).with_action("Divert to settling pond 2"),
        )
        .with_rule("Zn", PermitRule::new(2.0, 600.0).with_hysteresis(2, 5));

    RuntimeBuilder::new()
        .listen_addr("127.0.0.1:9081".parse()?)
        .metrics_addr("127.0.0.1:9091".parse()?)
        .permit(permit)
        .relay(Arc::new(MemoryRelay::new("plant-7")))
        .run(|sender| async move {
            sender.push(Reading::new("Cu", 0.0, 0.12)?).await?;
            sender.push(Reading::new("Zn", 0.0, 1.1)?).await?;
            Ok(())
        })
        .await
}
