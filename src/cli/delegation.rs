//! Delegation and event commands.

use std::time::Duration;

use crate::agent::delegation::DelegationRequest;
use crate::agent::events::EventStream;
use crate::cli::{print_json, read_text};
use crate::service::Troupe;

pub struct DelegateArgs {
    pub parent: String,
    pub child: String,
    pub task: String,
    pub session: String,
    pub timeout_secs: Option<u64>,
}

/// Run the delegation in this process, then stop whatever it started.
pub async fn delegate(troupe: &Troupe, args: DelegateArgs) -> anyhow::Result<()> {
    let mut request = DelegationRequest::new(args.parent, args.child, read_text(args.task)?)
        .with_parent_session(args.session);
    if let Some(secs) = args.timeout_secs {
        request = request.with_timeout(Duration::from_secs(secs));
    }

    let outcome = troupe.delegate(request).await;
    troupe.shutdown().await;
    print_json(&outcome?)
}

pub async fn show_runs(
    troupe: &Troupe,
    run_id: Option<&str>,
    parent: Option<&str>,
) -> anyhow::Result<()> {
    match run_id {
        Some(run_id) => print_json(&troupe.get_delegation_run(run_id).await?),
        None => print_json(&troupe.list_delegation_runs(parent).await),
    }
}

pub async fn show_events(
    troupe: &Troupe,
    id: &str,
    limit: usize,
    stream: Option<EventStream>,
) -> anyhow::Result<()> {
    let mut events = troupe.agent_event_history(id, limit).await?;
    if let Some(stream) = stream {
        events.retain(|e| e.stream == stream);
    }
    for event in events {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}
