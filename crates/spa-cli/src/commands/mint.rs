//! `spa mint`: print a signed token without contacting a gateway.

use super::credential::{self, CredentialArgs};
use crate::config::CredentialConfig;
use anyhow::Result;

pub fn run(args: &CredentialArgs, cfg: &CredentialConfig) -> Result<()> {
    let token = credential::mint(args, cfg)?;
    println!("{token}");
    Ok(())
}
