//! In-process walkthrough: one worker pool, the demo tasks, and a producer
//! submitting single tasks, workflows and a bulk batch.

use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::{Value, json};
use skein_core::{App, TaskId, TaskSignature, TaskStatus, Workflow, WorkflowHandle};

pub async fn run(app: &App, bulk: usize, timeout: Duration) -> anyhow::Result<()> {
    let pool = app.spawn_workers();
    let client = app.client();

    let id = client
        .submit(TaskSignature::new("add").arg(3).arg(4))
        .await?;
    report("add(3, 4)", &client.wait_for(id, timeout).await?.result().cloned());

    let root = match client
        .submit_workflow(Workflow::Chain(vec![
            TaskSignature::new("add").arg(3).arg(4),
            TaskSignature::new("multiply").arg(2),
        ]))
        .await?
    {
        WorkflowHandle::Chain { root } => root,
        other => bail!("chain returned {other:?}"),
    };
    let last = client.composer().wait_chain(root, timeout).await?;
    report("chain add(3, 4) | multiply(2)", &last.result().cloned());

    let ids = match client
        .submit_workflow(Workflow::Group(
            (1..=4).map(|i| TaskSignature::new("add").arg(i).arg(i)).collect(),
        ))
        .await?
    {
        WorkflowHandle::Group { ids } => ids,
        other => bail!("group returned {other:?}"),
    };
    let values = wait_all(app, &ids, timeout).await?;
    report("group add(i, i) for i in 1..=4", &Some(Value::Array(values)));

    let chord = match client
        .submit_workflow(Workflow::Chord {
            header: vec![
                TaskSignature::new("add").arg(1).arg(1).kwarg("delay_ms", 300),
                TaskSignature::new("add").arg(2).arg(1).kwarg("delay_ms", 100),
                TaskSignature::new("add").arg(3).arg(1),
            ],
            body: TaskSignature::new("summarize"),
        })
        .await?
    {
        WorkflowHandle::Chord(handle) => handle,
        other => bail!("chord returned {other:?}"),
    };
    let summary = client.wait_for(chord.result_id, timeout).await?;
    report("chord [add(1,1), add(2,1), add(3,1)] -> summarize", &summary.result().cloned());

    let id = client.submit(TaskSignature::new("important_task")).await?;
    report("important_task (high_priority)", &client.wait_for(id, timeout).await?.result().cloned());

    let id = client.submit(TaskSignature::new("failing_task")).await?;
    let record = client.wait_for(id, timeout).await?;
    match record.status() {
        TaskStatus::Success => report(
            &format!("failing_task after {} retries", record.retries()),
            &record.result().cloned(),
        ),
        _ => println!(
            "failing_task gave up after {} retries: {}",
            record.retries(),
            record.error().map(ToString::to_string).unwrap_or_default()
        ),
    }

    let ids = client
        .submit_many((0..bulk).map(|_| TaskSignature::new("io_bound_task").arg(50)))
        .await?;
    let values = wait_all(app, &ids, timeout).await?;
    println!("bulk io_bound_task: {} of {bulk} succeeded", values.len());

    print!("{}", app.status().await?);
    pool.shutdown_and_join().await;
    Ok(())
}

async fn wait_all(app: &App, ids: &[TaskId], timeout: Duration) -> anyhow::Result<Vec<Value>> {
    let client = app.client();
    let mut values = Vec::with_capacity(ids.len());
    for &id in ids {
        let record = client
            .wait_for(id, timeout)
            .await
            .with_context(|| format!("waiting for {id}"))?;
        if record.status() == TaskStatus::Success {
            values.push(record.result().cloned().unwrap_or(json!(null)));
        }
    }
    Ok(values)
}

fn report(label: &str, value: &Option<Value>) {
    match value {
        Some(value) => println!("{label} = {value}"),
        None => println!("{label} produced no value"),
    }
}
