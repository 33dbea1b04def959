//! Identity generation and export

use crate::cli::{ExportArgs, KeygenArgs};
use crate::commands::PeerBundle;
use anyhow::Context;
use umbra_crypto::keys::Keystore;
use umbra_crypto::IdentityKeyPair;

/// Generate (or report) the node identity
pub fn run(args: KeygenArgs) -> anyhow::Result<()> {
    let store = Keystore::open(&args.keystore)
        .with_context(|| format!("opening keystore at {}", args.keystore.display()))?;

    if store.has_identity() && !args.force {
        let identity = store.load()?;
        println!("identity exists: {}", identity.id().to_hex());
        println!("keystore: {}", store.dir().display());
        return Ok(());
    }

    let identity = IdentityKeyPair::generate();
    store.save(&identity)?;

    println!("generated identity: {}", identity.id().to_hex());
    println!("keystore: {}", store.dir().display());
    Ok(())
}

/// Write the public identity bundle for sharing with peers
pub fn export(args: ExportArgs) -> anyhow::Result<()> {
    let store = Keystore::open(&args.keystore)?;
    let identity = store
        .load()
        .context("no identity found; run `umbra keygen` first")?;

    let bundle = PeerBundle {
        node_id: *identity.id().as_bytes(),
        key: identity.signer().public_key(),
    };

    std::fs::write(&args.out, bincode::serialize(&bundle)?)
        .with_context(|| format!("writing {}", args.out.display()))?;

    println!("exported {} to {}", identity.id().to_hex(), args.out.display());
    Ok(())
}
