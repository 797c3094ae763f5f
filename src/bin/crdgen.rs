#[path = "../types.rs"]
mod types;

use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    println!("{}", serde_yaml::to_string(&types::Download::crd())?);
    Ok(())
}
