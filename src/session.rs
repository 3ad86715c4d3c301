use anyhow::{bail, Context, Result};

use crate::args::BaseArgs;
use crate::config::Config;
use crate::remote::FirebaseClient;

/// Builds a client from flags, environment, and config, in that order.
pub fn connect(base: &BaseArgs, config: &Config) -> Result<FirebaseClient> {
    let secret = match base.secret.as_deref().map(str::trim) {
        Some(secret) if !secret.is_empty() => secret,
        _ => bail!("--secret required (or set FIREBASE_SECRET)"),
    };

    if let Some(url) = base.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return FirebaseClient::with_base_url(url.trim(), secret)
            .with_context(|| format!("failed to create client for {url}"));
    }

    let name = base
        .firebase
        .clone()
        .or_else(|| config.firebase.clone())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty());
    match name {
        Some(name) => FirebaseClient::new(&name, secret)
            .with_context(|| format!("failed to create client for database '{name}'")),
        None => bail!("--firebase required (or set FIREBASE_NAME, or `firebase` in firebak.json)"),
    }
}
