//! Drains the scheduler's priority queue and runs each due task to
//! completion, requeueing with backoff on retryable errors (§4.6/§10.1).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::center::Center;
use crate::domain::{UnixTime, ZoneId};
use crate::enforcer;
use crate::error::EnforcerError;
use crate::keys::factory::{self, KeyRequest};
use crate::manager::TargetCommand;
use crate::resalt;
use crate::scheduler::{TaskKind, TaskTarget};

/// How long to sleep when the queue has nothing due yet.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// The minimum number of spare HSM keys a `key-generate` task tries to keep
/// in the pool per (role, algorithm, bits, repository) slot.
const POOL_TARGET: u32 = 2;

pub async fn run(center: Arc<Center>, mut cmd_rx: mpsc::UnboundedReceiver<TargetCommand>) {
    loop {
        if let Ok(TargetCommand::Terminate) = cmd_rx.try_recv() {
            tracing::info!("scheduler worker shutting down");
            return;
        }

        let now = center.scheduler.clock.now();
        let Some(task) = center.scheduler.pop_ready(now) else {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => {
                    if matches!(cmd, None | Some(TargetCommand::Terminate)) {
                        tracing::info!("scheduler worker shutting down");
                        return;
                    }
                }
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
            continue;
        };

        match run_task(&center, task.kind, &task.target, now) {
            Ok(()) => center.scheduler.complete(task.id),
            Err(err) if err.is_retryable() => {
                tracing::warn!("task {:?} on {:?} failed, retrying: {err}", task.kind, task.target);
                center.scheduler.defer(task.id, now);
            }
            Err(err) => {
                tracing::error!("task {:?} on {:?} failed permanently: {err}", task.kind, task.target);
                center.scheduler.complete(task.id);
            }
        }
    }
}

fn run_task(center: &Center, kind: TaskKind, target: &TaskTarget, now: UnixTime) -> Result<(), EnforcerError> {
    match (kind, target) {
        (TaskKind::Enforce, TaskTarget::Zone(zone_id)) => run_enforce(center, *zone_id, now),
        (TaskKind::Signconf, TaskTarget::Zone(zone_id)) => resalt::emit_signconf(center, *zone_id).map(|_| ()),
        (TaskKind::Resalt, _) => resalt::resalt_due_policies(center, now).map(|_| ()),
        (TaskKind::KeyGenerate, TaskTarget::Policy(name)) => replenish_pools(center, name),
        (TaskKind::DsTransition, TaskTarget::Zone(_)) => {
            // DS-at-parent transitions are driven entirely by operator
            // commands (`key ds-seen` / `key ds-gone`); nothing to poll.
            Ok(())
        }
        (kind, target) => {
            tracing::warn!("task {kind:?} enqueued against the wrong target kind: {target:?}");
            Ok(())
        }
    }
}

fn run_enforce(center: &Center, zone_id: ZoneId, now: UnixTime) -> Result<(), EnforcerError> {
    let policy_name = {
        let txn = center.db.transaction()?;
        let zone = txn.get_zone(zone_id).ok_or_else(|| {
            EnforcerError::InvariantViolated(format!("zone {zone_id} vanished before its own enforce task"))
        })?;
        zone.policy.clone()
    };

    let policy = {
        let policies = center.policies.lock().unwrap();
        policies
            .get(&policy_name)
            .ok_or_else(|| EnforcerError::PolicyInvalid(format!("zone references unknown policy '{policy_name}'")))?
            .clone()
    };

    let outcome = enforcer::enforce(&center.db, center.key_repo.as_ref(), &center.locks, zone_id, &policy, now)?;

    if let Some(next) = outcome.next_change {
        center.scheduler.enqueue(TaskKind::Enforce, TaskTarget::Zone(zone_id), next);
    }
    if outcome.signconf_dirty {
        center.scheduler.enqueue(TaskKind::Signconf, TaskTarget::Zone(zone_id), now);
    }
    for keytag in &outcome.ds_submit {
        tracing::warn!("zone {zone_id}: submit DS for keytag {keytag} to the parent");
    }
    for keytag in &outcome.ds_retract {
        tracing::warn!("zone {zone_id}: retract DS for keytag {keytag} from the parent");
    }
    Ok(())
}

fn replenish_pools(center: &Center, policy_name: &str) -> Result<(), EnforcerError> {
    let slots = {
        let policies = center.policies.lock().unwrap();
        let Some(policy) = policies.get(policy_name) else { return Ok(()) };
        policy.latest.keys.clone()
    };

    let mut txn = center.db.transaction()?;
    for slot in &slots {
        let req = KeyRequest {
            bits: slot.algorithm.bits(),
            repository: &slot.repository,
            policy: policy_name,
            algorithm: slot.algorithm.algorithm_number(),
            role: slot.role,
        };
        let spare = txn
            .list_hsm_keys()
            .filter(|k| {
                k.inception.is_none()
                    && k.bits == req.bits
                    && &*k.repository == req.repository
                    && &*k.policy == req.policy
                    && k.algorithm == req.algorithm
                    && k.role == req.role
            })
            .count() as u32;
        if spare < POOL_TARGET {
            factory::replenish(&mut txn, center.key_repo.as_ref(), &req, POOL_TARGET - spare)?;
        }
    }
    txn.commit();
    Ok(())
}
