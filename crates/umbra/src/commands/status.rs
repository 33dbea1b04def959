//! Identity and keystore inspection
//!
//! Live tunnel status is reported by the running `up` process (the control
//! transport is out of scope); this command inspects the persisted state.

use crate::cli::StatusArgs;
use serde::Serialize;
use umbra_crypto::keys::Keystore;

#[derive(Serialize)]
struct KeystoreStatus {
    keystore: String,
    has_identity: bool,
    node_id: Option<String>,
}

pub fn run(args: StatusArgs) -> anyhow::Result<()> {
    let store = Keystore::open(&args.keystore)?;

    let node_id = if store.has_identity() {
        Some(store.load()?.id().to_hex())
    } else {
        None
    };

    let status = KeystoreStatus {
        keystore: store.dir().display().to_string(),
        has_identity: node_id.is_some(),
        node_id,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("keystore: {}", status.keystore);
        match &status.node_id {
            Some(id) => println!("node id: {}", id),
            None => println!("no identity (run `umbra keygen`)"),
        }
    }

    Ok(())
}
