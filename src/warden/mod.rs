use anyhow::{Context, Result};
use engine_api::client::EngineApiClient;
use futures_util::StreamExt;
use rules_engine::{DirectoryPolicyLoader, PolicyLoader, RuleSet, RuleSetOpts};

mod term_print;

use crate::{
    cli::warden::{CheckPolicies, Commands, Monitor, WardenCliOpts},
    warden::term_print::TermPrintable,
};

pub async fn warden_cli_run(options: &WardenCliOpts) -> Result<()> {
    log::trace!("Warden CLI Options: {:?}", options);

    log::trace!("Command received: {:?}", options.command);

    match &options.command {
        Commands::CheckPolicies(CheckPolicies { policies_dir }) => {
            let loader = DirectoryPolicyLoader::new(policies_dir);
            let mut rule_set = RuleSet::new(RuleSetOpts::default());
            loader
                .load_policies(&mut rule_set)
                .with_context(|| format!("invalid policies in {policies_dir}"))?;
            rule_set.term_print()
        }
        Commands::Monitor(Monitor { rule, json }) => {
            let engine_api_client = if let Some(api_server) = &options.api_server {
                EngineApiClient::unix(api_server.clone())?
            } else {
                EngineApiClient::new()?
            };

            let mut stream = Box::pin(engine_api_client.event_monitor().await?);

            while let Some(ws_read) = stream.next().await {
                let message = ws_read.context("error reading from websocket")?;
                if rule.as_ref().is_some_and(|rule| *rule != message.rule_id) {
                    continue;
                }
                if *json {
                    println!("{}", serde_json::to_string(&message)?);
                } else {
                    message.term_print()?;
                }
            }

            Err(anyhow::anyhow!("event stream ended"))
        }
    }?;

    Ok(())
}
