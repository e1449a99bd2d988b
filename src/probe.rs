//! This module implements the environment prober. Before the limit search starts, the target
//! is spawned once per environment variable with that variable deleted, and every variable
//! whose absence changes the output fingerprint is reported to the operator. The probe is
//! informational: the search itself always runs with the full environment.
//!

use crate::filters::FilterSet;
use crate::fingerprint;
use crate::process::Spawner;
use crate::rlimits::LimitVector;
use crate::Result;

/// Spawn the target once per environment entry and collect the names of the variables that
/// influence its fingerprint.
pub fn probe_environment(spawner: &Spawner, limits: &LimitVector, filters: &FilterSet)
    -> Result<Vec<String>> {
    let envs = spawner.envs().to_vec();

    let (term, stdout, stderr) = spawner.spawn(limits)?;
    let baseline = fingerprint::fingerprint_streams(term, filters, &stdout, &stderr);

    let mut influential = Vec::new();
    for index in 0..envs.len() {
        // A one-entry deletion of the environment vector.
        let mut variant = envs.clone();
        variant.remove(index);

        let (term, stdout, stderr) = spawner.spawn_with_env(limits, &variant)?;
        let key = fingerprint::fingerprint_streams(term, filters, &stdout, &stderr);

        if key != baseline {
            let name = envs[index].split('=').next().unwrap_or("").to_owned();
            log::info!("environment variable {} influences the output", name);
            influential.push(name);
        }
    }

    Ok(influential)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;
    use std::time::Duration;

    #[test]
    fn test_probe_finds_influential_variable() {
        let command = vec!["sh".to_owned(), "-c".to_owned(), "echo \"marker=$MARKER\"".to_owned()];
        let envs = vec![
            format!("PATH={}", std::env::var("PATH").unwrap_or_default()),
            "MARKER=sentinel".to_owned(),
            "UNUSED=whatever".to_owned(),
        ];
        let stdin = File::open("/dev/null").unwrap();
        let spawner = Spawner::new(&command, envs, stdin, Duration::from_secs(5)).unwrap();

        let filters = FilterSet::empty();
        let limits = LimitVector::from_current();
        let influential = probe_environment(&spawner, &limits, &filters).unwrap();

        assert!(influential.contains(&"MARKER".to_owned()));
        assert!(!influential.contains(&"UNUSED".to_owned()));
    }
}
