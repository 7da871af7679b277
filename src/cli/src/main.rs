//! The thinnest possible front-end for the chain engine: loads a template
//! file (YAML or JSON), builds an [`Environment`], constructs a [`Chain`],
//! runs it to completion, and prints the final result as JSON.
//!
//! Argument parsing beyond `<template-path> [env-path]` and credential
//! loading are out of scope for this binary; it exists to produce a
//! runnable artifact, not to be a full operator CLI.

use chain_engine::{Chain, ChainConfig, Environment, Registry};
use std::path::Path;
use std::process;
use std::sync::Arc;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let template_path = match args.next() {
        Some(path) => path,
        None => {
            eprintln!("usage: chain <template-path> [environment-path]");
            process::exit(2);
        }
    };

    let mut environment = Environment::new();
    if let Some(env_path) = args.next() {
        if let Err(err) = environment.load(&env_path) {
            eprintln!("failed to load environment file {}: {}", env_path, err);
            process::exit(1);
        }
    }

    let config = match load_chain_config(&template_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load template {}: {}", template_path, err);
            process::exit(1);
        }
    };

    let registry = Registry::new();
    chain_tasks::register_all(&registry);

    let mut chain = match Chain::new(config, Arc::new(registry), Arc::new(environment), None) {
        Ok(chain) => chain,
        Err(err) => {
            eprintln!("failed to build chain: {}", err);
            process::exit(1);
        }
    };

    let result = chain.run();
    match serde_json::to_string_pretty(&result) {
        Ok(rendered) => println!("{}", rendered),
        Err(err) => {
            eprintln!("failed to render chain result: {}", err);
            process::exit(1);
        }
    }

    if !chain.errors.is_empty() {
        process::exit(1);
    }
}

fn load_chain_config(path: impl AsRef<Path>) -> Result<ChainConfig, String> {
    let path = path.as_ref();
    let contents =
        std::fs::read_to_string(path).map_err(|err| format!("could not read {}: {}", path.display(), err))?;

    let document: serde_json::Value = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(|err| err.to_string())?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&contents).map_err(|err| err.to_string())?,
        _ => {
            return Err(format!(
                "unsupported file type {}; supported types are .json, .yaml, and .yml",
                path.display()
            ))
        }
    };

    let chain_config = unwrap_chain_kind(document)?;
    serde_json::from_value(chain_config).map_err(|err| err.to_string())
}

/// A template's top level is a mapping with exactly one non-`.`-prefixed
/// key naming the registered chain kind (e.g. `report`, `harvest`); its
/// value is the chain configuration. Keys starting with `.` are reserved
/// for document metadata and are ignored.
fn unwrap_chain_kind(document: serde_json::Value) -> Result<serde_json::Value, String> {
    let obj = document
        .as_object()
        .ok_or_else(|| "template top level must be a mapping".to_owned())?;

    let mut kinds = obj.iter().filter(|(key, _)| !key.starts_with('.'));
    let (_, config) = kinds
        .next()
        .ok_or_else(|| "template is missing a chain-kind key".to_owned())?;

    if kinds.next().is_some() {
        return Err("template must name exactly one chain kind at its top level".to_owned());
    }

    Ok(config.clone())
}
