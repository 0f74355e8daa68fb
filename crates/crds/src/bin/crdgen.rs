//! Prints the CRD manifests owned by the static IP controller.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crds.yaml`

use crds::{IPClaim, IPPool};
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    for crd in [IPPool::crd(), IPClaim::crd()] {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
