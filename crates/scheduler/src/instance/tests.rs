#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use kiln_core::{
        work_fn, KilnError, Priority, ResourceSpec, SchedulingStrategy, Task, TaskStatus,
        WorkError, WorkOutput, WorkUnit,
    };

    use crate::instance::SchedulerInstance;
    use crate::registry::ResourceInfo;
    use crate::types::InstanceConfig;

    /// Work that blocks until the gate opens or the task is cancelled.
    #[derive(Clone, Default)]
    struct Gate(Arc<AtomicBool>);

    impl Gate {
        fn open(&self) {
            self.0.store(true, Ordering::SeqCst);
        }

        fn work(&self) -> Arc<dyn WorkUnit> {
            let gate = Arc::clone(&self.0);
            work_fn(move |ctx| {
                while !gate.load(Ordering::SeqCst) {
                    if ctx.is_cancelled() {
                        return Err(WorkError::Cancelled);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(WorkOutput::items(1))
            })
        }
    }

    fn quick() -> Arc<dyn WorkUnit> {
        work_fn(|_| Ok(WorkOutput::items(1)))
    }

    fn instance(config: InstanceConfig) -> SchedulerInstance {
        SchedulerInstance::new(config).unwrap()
    }

    fn with_resource(config: InstanceConfig, id: &str, capacity: usize) -> SchedulerInstance {
        let inst = instance(config);
        inst.register_resource(Arc::new(ResourceSpec::new(id, capacity)))
            .unwrap();
        inst
    }

    /// Poll until `cond` holds or two seconds pass.
    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn wait_for_status(inst: &SchedulerInstance, id: &str, status: TaskStatus) -> bool {
        wait_until(|| inst.task_status(id) == Some(status))
    }

    // ── Submission ────────────────────────────────────────────

    #[test]
    fn submitted_task_is_immediately_queued() {
        let inst = instance(InstanceConfig::new("i"));
        let handle = inst.submit(Task::new("a", quick())).unwrap();
        assert_eq!(handle.status(), TaskStatus::Queued);
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Queued));
        assert_eq!(inst.queue_size(), 1);
        assert_eq!(inst.metrics().submitted, 1);
    }

    #[test]
    fn malformed_task_is_rejected() {
        let inst = instance(InstanceConfig::new("i"));
        let result = inst.submit(Task::new("", quick()));
        assert!(matches!(result, Err(KilnError::InvalidTask(_))));
        let result = inst.submit(Task::new("heavy", quick()).weight(2.0));
        assert!(matches!(result, Err(KilnError::InvalidTask(_))));
        assert_eq!(inst.queue_size(), 0);
        assert_eq!(inst.metrics().rejected, 2);
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let inst = instance(InstanceConfig::new("i"));
        inst.submit(Task::new("a", quick())).unwrap();
        assert!(matches!(
            inst.submit(Task::new("a", quick())),
            Err(KilnError::InvalidTask(_))
        ));
    }

    #[test]
    fn queue_full_scenario() {
        let inst = with_resource(
            InstanceConfig::new("i").max_queue_size(2).max_concurrent_tasks(1),
            "r1",
            1,
        );
        let gate = Gate::default();
        inst.submit(Task::new("A", gate.work())).unwrap();
        inst.submit(Task::new("B", gate.work())).unwrap();

        let rejected = inst.submit(Task::new("C", gate.work()));
        assert!(matches!(
            rejected,
            Err(KilnError::QueueFull { capacity: 2, .. })
        ));
        assert_eq!(inst.queue_size(), 2);
        assert_eq!(inst.task_status("C"), None);

        let report = inst.tick();
        assert_eq!(report.dispatched, 1);
        assert_eq!(inst.task_status("A"), Some(TaskStatus::Running));
        assert_eq!(inst.task_status("B"), Some(TaskStatus::Queued));
        assert_eq!(inst.resource("r1").unwrap().active, 1);

        gate.open();
        assert!(wait_for_status(&inst, "A", TaskStatus::Completed));
        inst.tick();
        assert!(wait_for_status(&inst, "B", TaskStatus::Completed));
    }

    #[test]
    fn submit_async_returns_failed_handle_on_rejection() {
        let inst = instance(InstanceConfig::new("i").max_queue_size(1));
        let first = inst.submit_async(Task::new("a", quick()));
        assert_eq!(first.status(), TaskStatus::Queued);

        let second = inst.submit_async(Task::new("b", quick()));
        assert!(second.is_finished());
        let snap = second.snapshot();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert!(matches!(snap.error, Some(KilnError::QueueFull { .. })));
    }

    // ── Placement ─────────────────────────────────────────────

    #[test]
    fn concurrency_budget_is_respected() {
        let inst = instance(InstanceConfig::new("i").max_concurrent_tasks(2));
        inst.register_resource(Arc::new(ResourceSpec::new("r1", 5))).unwrap();
        inst.register_resource(Arc::new(ResourceSpec::new("r2", 5))).unwrap();
        let gate = Gate::default();
        for i in 0..5 {
            inst.submit(Task::new(format!("t{i}"), gate.work())).unwrap();
        }
        inst.tick();
        inst.tick();
        assert_eq!(inst.active_tasks().len(), 2);
        assert_eq!(inst.queue_size(), 3);
        assert_eq!(inst.utilization(), 1.0);
        gate.open();
    }

    #[test]
    fn least_loaded_capacity_two_scenario() {
        let inst = with_resource(
            InstanceConfig::new("i").strategy(SchedulingStrategy::LeastLoaded),
            "R",
            2,
        );
        let first = Gate::default();
        let second = Gate::default();
        inst.submit(Task::new("t1", first.work())).unwrap();
        inst.submit(Task::new("t2", second.work())).unwrap();
        inst.tick();

        assert_eq!(inst.task_snapshot("t1").unwrap().resource_id.as_deref(), Some("R"));
        assert_eq!(inst.task_snapshot("t2").unwrap().resource_id.as_deref(), Some("R"));
        assert_eq!(inst.resource("R").unwrap().active, 2);

        let third = Gate::default();
        third.open();
        inst.submit(Task::new("t3", third.work())).unwrap();
        inst.tick();
        assert_eq!(inst.task_status("t3"), Some(TaskStatus::Queued));

        first.open();
        assert!(wait_for_status(&inst, "t1", TaskStatus::Completed));
        assert_eq!(inst.resource("R").unwrap().active, 1);
        inst.tick();
        assert_ne!(inst.task_status("t3"), Some(TaskStatus::Queued));
        assert!(wait_for_status(&inst, "t3", TaskStatus::Completed));
        second.open();
    }

    #[test]
    fn round_robin_alternates_resources() {
        let inst = instance(
            InstanceConfig::new("i")
                .strategy(SchedulingStrategy::RoundRobin)
                .max_concurrent_tasks(4),
        );
        inst.register_resource(Arc::new(ResourceSpec::new("r1", 4))).unwrap();
        inst.register_resource(Arc::new(ResourceSpec::new("r2", 4))).unwrap();
        let gate = Gate::default();
        for i in 0..4 {
            inst.submit(Task::new(format!("t{i}"), gate.work())).unwrap();
        }
        inst.tick();
        let placed: Vec<String> = (0..4)
            .map(|i| {
                inst.task_snapshot(&format!("t{i}"))
                    .unwrap()
                    .resource_id
                    .unwrap()
            })
            .collect();
        assert_eq!(placed, vec!["r1", "r2", "r1", "r2"]);
        gate.open();
    }

    #[test]
    fn priority_strategy_dispatches_most_urgent_first() {
        let inst = with_resource(
            InstanceConfig::new("i")
                .strategy(SchedulingStrategy::Priority)
                .max_concurrent_tasks(1),
            "r1",
            1,
        );
        let gate = Gate::default();
        inst.submit(Task::new("low", gate.work()).priority(Priority::Low)).unwrap();
        inst.submit(Task::new("urgent", gate.work()).priority(Priority::Urgent)).unwrap();
        inst.submit(Task::new("normal", gate.work())).unwrap();
        inst.tick();
        assert_eq!(inst.active_tasks(), vec!["urgent"]);
        assert_eq!(inst.queued_tasks(), vec!["low", "normal"]);
        gate.open();
    }

    #[test]
    fn offline_resource_is_skipped() {
        let inst = instance(InstanceConfig::new("i"));
        inst.register_resource(Arc::new(ResourceSpec::new("down", 4).offline())).unwrap();
        inst.register_resource(Arc::new(ResourceSpec::new("up", 1))).unwrap();
        assert_eq!(inst.available_resources().len(), 1);
        inst.submit(Task::new("a", quick())).unwrap();
        inst.tick();
        assert_eq!(inst.task_snapshot("a").unwrap().resource_id.as_deref(), Some("up"));
    }

    #[test]
    fn custom_scorer_drives_placement() {
        let inst = instance(InstanceConfig::new("i").strategy(SchedulingStrategy::Custom));
        inst.register_resource(Arc::new(ResourceSpec::new("small", 1))).unwrap();
        inst.register_resource(Arc::new(ResourceSpec::new("large", 8))).unwrap();
        inst.set_scorer(Arc::new(|_: &Task, r: &ResourceInfo| r.capacity as f64));
        inst.submit(Task::new("a", quick())).unwrap();
        inst.tick();
        assert_eq!(inst.task_snapshot("a").unwrap().resource_id.as_deref(), Some("large"));
    }

    #[test]
    fn queued_task_times_out_without_resources() {
        let inst = instance(InstanceConfig::new("i"));
        let handle = inst
            .submit(Task::new("late", quick()).timeout(Duration::from_millis(50)))
            .unwrap();
        inst.tick();
        assert_eq!(inst.task_status("late"), Some(TaskStatus::Queued));

        std::thread::sleep(Duration::from_millis(100));
        let report = inst.tick();
        assert_eq!(report.timed_out, 1);
        let snap = handle.snapshot();
        assert_eq!(snap.status, TaskStatus::Failed);
        assert_eq!(snap.error, Some(KilnError::NoResourceAvailable("late".into())));
        assert_eq!(inst.queue_size(), 0);
        assert_eq!(inst.metrics().timed_out, 1);
    }

    #[test]
    fn no_timeout_waits_indefinitely() {
        let inst = instance(InstanceConfig::new("i"));
        inst.submit(Task::new("patient", quick())).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(inst.tick().timed_out, 0);
        assert_eq!(inst.task_status("patient"), Some(TaskStatus::Queued));
    }

    #[test]
    fn suspended_time_does_not_count_toward_placement_timeout() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 4);
        inst.submit(Task::new("a", quick()).timeout(Duration::from_millis(50)))
            .unwrap();
        assert!(inst.suspend("a"));
        std::thread::sleep(Duration::from_millis(100));
        assert!(inst.resume("a"));

        let report = inst.tick();
        assert_eq!(report.timed_out, 0);
        assert_eq!(report.dispatched, 1);
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
    }

    #[test]
    fn placement_clock_restarts_after_resume() {
        let inst = instance(InstanceConfig::new("i"));
        inst.submit(Task::new("a", quick()).timeout(Duration::from_millis(50)))
            .unwrap();
        assert!(inst.suspend("a"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(inst.resume("a"));
        inst.tick();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(inst.tick().timed_out, 0);
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Queued));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(inst.tick().timed_out, 1);
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Failed));
    }

    #[test]
    fn dependent_blocked_on_running_parent_does_not_time_out() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 2);
        let gate = Gate::default();
        inst.submit(Task::new("parent", gate.work())).unwrap();
        inst.submit(
            Task::new("child", quick())
                .depends_on("parent")
                .timeout(Duration::from_millis(50)),
        )
        .unwrap();
        assert_eq!(inst.tick().dispatched, 1);

        std::thread::sleep(Duration::from_millis(100));
        let report = inst.tick();
        assert_eq!(report.timed_out, 0);
        assert_eq!(inst.task_status("child"), Some(TaskStatus::Queued));

        gate.open();
        assert!(wait_for_status(&inst, "parent", TaskStatus::Completed));
        assert_eq!(inst.tick().dispatched, 1);
        assert!(wait_for_status(&inst, "child", TaskStatus::Completed));
    }

    #[test]
    fn running_task_past_timeout_is_flagged_not_killed() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        let gate = Gate::default();
        inst.submit(Task::new("slow", gate.work()).timeout(Duration::from_millis(10)))
            .unwrap();
        inst.tick();
        std::thread::sleep(Duration::from_millis(30));
        let report = inst.tick();
        assert_eq!(report.overdue, 1);
        let snap = inst.task_snapshot("slow").unwrap();
        assert!(snap.overdue);
        assert_eq!(snap.status, TaskStatus::Running);
        gate.open();
        assert!(wait_for_status(&inst, "slow", TaskStatus::Completed));
    }

    #[test]
    fn overdue_is_measured_from_dispatch() {
        let inst = instance(InstanceConfig::new("i"));
        let gate = Gate::default();
        inst.submit(Task::new("late", gate.work()).timeout(Duration::from_millis(150)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        inst.register_resource(Arc::new(ResourceSpec::new("r1", 1)))
            .unwrap();
        let report = inst.tick();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.overdue, 0);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(inst.tick().overdue, 0);
        assert!(!inst.task_snapshot("late").unwrap().overdue);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(inst.tick().overdue, 1);
        gate.open();
        assert!(wait_for_status(&inst, "late", TaskStatus::Completed));
    }

    // ── Cancel / suspend / resume ─────────────────────────────

    #[test]
    fn cancel_on_terminal_task_is_refused() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        inst.submit(Task::new("done", quick())).unwrap();
        inst.tick();
        assert!(wait_for_status(&inst, "done", TaskStatus::Completed));

        assert!(!inst.cancel("done"));
        assert_eq!(inst.task_status("done"), Some(TaskStatus::Completed));
        assert!(!inst.cancel("unknown"));
    }

    #[test]
    fn cancel_running_task_releases_slot() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        let gate = Gate::default();
        let handle = inst.submit(Task::new("a", gate.work())).unwrap();
        inst.tick();
        assert_eq!(inst.resource("r1").unwrap().active, 1);

        assert!(inst.cancel("a"));
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert_eq!(inst.resource("r1").unwrap().active, 0);
        assert!(!inst.cancel("a"));
        assert_eq!(inst.metrics().cancelled, 1);
    }

    #[test]
    fn cancel_queued_task_leaves_queue() {
        let inst = instance(InstanceConfig::new("i"));
        inst.submit(Task::new("a", quick())).unwrap();
        assert!(inst.cancel("a"));
        assert_eq!(inst.queue_size(), 0);
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Cancelled));
    }

    /// Work that ignores cancellation and only stops when `release` is set.
    fn stubborn(release: &Arc<AtomicBool>) -> Arc<dyn WorkUnit> {
        let release = Arc::clone(release);
        work_fn(move |_| {
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(WorkOutput::default())
        })
    }

    fn flagging(flag: &Arc<AtomicBool>) -> Arc<dyn WorkUnit> {
        let flag = Arc::clone(flag);
        work_fn(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(WorkOutput::items(1))
        })
    }

    fn started_within(flag: &AtomicBool, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        flag.load(Ordering::SeqCst)
    }

    #[test]
    fn next_task_runs_while_cancelled_unit_keeps_its_thread() {
        let inst = with_resource(InstanceConfig::new("i").max_concurrent_tasks(1), "r1", 2);
        let release = Arc::new(AtomicBool::new(false));
        inst.submit(Task::new("a", stubborn(&release))).unwrap();
        inst.tick();
        assert!(inst.cancel("a"));

        let started = Arc::new(AtomicBool::new(false));
        inst.submit(Task::new("b", flagging(&started))).unwrap();
        assert_eq!(inst.tick().dispatched, 1);
        assert!(started_within(&started, Duration::from_millis(500)));
        assert!(wait_for_status(&inst, "b", TaskStatus::Completed));

        release.store(true, Ordering::SeqCst);
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn next_task_runs_after_stubborn_suspension_loses_its_slot() {
        let inst = with_resource(
            InstanceConfig::new("i")
                .max_concurrent_tasks(1)
                .suspend_grace(Duration::from_millis(10)),
            "r1",
            2,
        );
        let release = Arc::new(AtomicBool::new(false));
        inst.submit(Task::new("a", stubborn(&release))).unwrap();
        inst.tick();
        assert!(inst.suspend("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(inst.tick().slots_released, 1);

        let started = Arc::new(AtomicBool::new(false));
        inst.submit(Task::new("b", flagging(&started))).unwrap();
        assert_eq!(inst.tick().dispatched, 1);
        assert!(started_within(&started, Duration::from_millis(500)));
        assert!(wait_for_status(&inst, "b", TaskStatus::Completed));
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn suspend_resume_round_trip_keeps_metadata() {
        let inst = instance(InstanceConfig::new("i"));
        inst.submit(Task::new("a", quick()).priority(Priority::High).weight(0.8))
            .unwrap();
        assert!(inst.suspend("a"));
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Suspended));
        assert_eq!(inst.queue_size(), 0);
        assert!(!inst.suspend("a"));

        assert!(inst.resume("a"));
        let snap = inst.task_snapshot("a").unwrap();
        assert_eq!(snap.status, TaskStatus::Queued);
        assert_eq!(snap.priority, Priority::High);
        assert_eq!(inst.task_weight("a"), Some(0.8));
        assert_eq!(inst.queue_size(), 1);
        assert!(!inst.resume("a"));
    }

    #[test]
    fn suspended_running_task_keeps_slot_and_is_promoted_on_resume() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        let gate = Gate::default();
        inst.submit(Task::new("a", gate.work())).unwrap();
        inst.tick();

        assert!(inst.suspend("a"));
        assert_eq!(inst.resource("r1").unwrap().active, 1);
        assert!(!inst.cancel("a"));

        assert!(inst.resume("a"));
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Queued));
        let report = inst.tick();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.dispatched, 0);
        let snap = inst.task_snapshot("a").unwrap();
        assert_eq!(snap.status, TaskStatus::Running);
        assert_eq!(snap.attempt, 1);

        gate.open();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
    }

    #[test]
    fn suspension_past_grace_releases_slot_and_redispatches() {
        let inst = with_resource(
            InstanceConfig::new("i").suspend_grace(Duration::from_millis(10)),
            "r1",
            1,
        );
        let gate = Gate::default();
        inst.submit(Task::new("a", gate.work())).unwrap();
        inst.tick();
        assert!(inst.suspend("a"));

        std::thread::sleep(Duration::from_millis(20));
        let report = inst.tick();
        assert_eq!(report.slots_released, 1);
        assert_eq!(inst.resource("r1").unwrap().active, 0);
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Suspended));

        assert!(inst.resume("a"));
        assert_eq!(inst.queue_size(), 1);
        inst.tick();
        let snap = inst.task_snapshot("a").unwrap();
        assert_eq!(snap.status, TaskStatus::Running);
        assert_eq!(snap.attempt, 2);

        gate.open();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
        assert!(wait_until(|| inst.resource("r1").unwrap().active == 0));
    }

    #[test]
    fn resume_fails_when_queue_is_full() {
        let inst = instance(InstanceConfig::new("i").max_queue_size(1));
        inst.submit(Task::new("a", quick())).unwrap();
        assert!(inst.suspend("a"));
        inst.submit(Task::new("b", quick())).unwrap();
        assert!(!inst.resume("a"));
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Suspended));
    }

    // ── Failures ──────────────────────────────────────────────

    #[test]
    fn work_errors_and_panics_are_recorded() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 4);
        inst.submit(Task::new(
            "err",
            work_fn(|_| Err(WorkError::Failed("kernel launch failed".into()))),
        ))
        .unwrap();
        inst.submit(Task::new("boom", work_fn(|_| panic!("device lost"))))
            .unwrap();
        inst.tick();

        assert!(wait_for_status(&inst, "err", TaskStatus::Failed));
        assert!(wait_for_status(&inst, "boom", TaskStatus::Failed));
        assert_eq!(
            inst.task_snapshot("err").unwrap().error,
            Some(KilnError::ExecutionFailure("kernel launch failed".into()))
        );
        assert_eq!(
            inst.task_snapshot("boom").unwrap().error_message().as_deref(),
            Some("device lost")
        );

        inst.submit(Task::new("after", quick())).unwrap();
        inst.tick();
        assert!(wait_for_status(&inst, "after", TaskStatus::Completed));
        assert!(wait_until(|| inst.metrics().failed == 2));
        assert_eq!(inst.resource("r1").unwrap().active, 0);
    }

    // ── Dependencies ──────────────────────────────────────────

    #[test]
    fn dependent_waits_for_completion() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 4);
        let gate = Gate::default();
        inst.submit(Task::new("a", gate.work())).unwrap();
        inst.submit(Task::new("b", quick()).depends_on("a")).unwrap();
        inst.tick();
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Running));
        assert_eq!(inst.task_status("b"), Some(TaskStatus::Queued));

        gate.open();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
        inst.tick();
        assert!(wait_for_status(&inst, "b", TaskStatus::Completed));
    }

    #[test]
    fn failed_dependency_fails_dependent() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 4);
        inst.submit(Task::new(
            "a",
            work_fn(|_| Err(WorkError::Failed("bad input".into()))),
        ))
        .unwrap();
        inst.submit(Task::new("b", quick()).depends_on("a")).unwrap();
        inst.tick();
        assert!(wait_for_status(&inst, "a", TaskStatus::Failed));

        let report = inst.tick();
        assert_eq!(report.dependency_failed, 1);
        assert_eq!(
            inst.task_snapshot("b").unwrap().error,
            Some(KilnError::DependencyFailed {
                task: "b".into(),
                dependency: "a".into(),
            })
        );
    }

    #[test]
    fn swept_dependency_still_resolves_from_history() {
        let inst = with_resource(InstanceConfig::new("i").retention(Duration::ZERO), "r1", 1);
        inst.submit(Task::new("a", quick())).unwrap();
        inst.tick();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
        let report = inst.tick();
        assert_eq!(report.swept, 1);
        assert!(inst.task_snapshot("a").is_none());
        assert_eq!(inst.task_status("a"), Some(TaskStatus::Completed));

        inst.submit(Task::new("b", quick()).depends_on("a")).unwrap();
        inst.tick();
        assert!(wait_until(|| inst.task_status("b") == Some(TaskStatus::Completed)));
    }

    // ── Resources ─────────────────────────────────────────────

    #[test]
    fn unregistering_resource_orphans_running_tasks() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        let gate = Gate::default();
        inst.submit(Task::new("a", gate.work())).unwrap();
        inst.tick();

        inst.unregister_resource("r1").unwrap();
        let snap = inst.task_snapshot("a").unwrap();
        assert!(snap.orphaned);
        assert_eq!(snap.status, TaskStatus::Running);
        assert!(matches!(
            inst.unregister_resource("r1"),
            Err(KilnError::ResourceNotFound(_))
        ));

        gate.open();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
        assert_eq!(inst.metrics().active_tasks, 0);
    }

    #[test]
    fn resource_management_round_trip() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        assert!(inst
            .register_resource(Arc::new(ResourceSpec::new("bad", 0)))
            .is_err());
        inst.set_resource_capacity("r1", 3).unwrap();
        inst.set_resource_online("r1", false).unwrap();
        inst.tick();
        let info = inst.resource("r1").unwrap();
        assert_eq!(info.capacity, 3);
        assert!(!info.online);
        inst.heartbeat("r1").unwrap();
        assert!(matches!(inst.heartbeat("nope"), Err(KilnError::ResourceNotFound(_))));
        assert_eq!(inst.resource_count(), 1);
    }

    // ── Configuration, profiling, lifecycle ───────────────────

    #[test]
    fn queue_bound_cannot_drop_below_length() {
        let inst = instance(InstanceConfig::new("i"));
        inst.submit(Task::new("a", quick())).unwrap();
        inst.submit(Task::new("b", quick())).unwrap();
        assert!(inst.set_max_queue_size(1).is_err());
        inst.set_max_queue_size(2).unwrap();
        assert!(matches!(
            inst.submit(Task::new("c", quick())),
            Err(KilnError::QueueFull { .. })
        ));
        inst.set_strategy(SchedulingStrategy::Weighted);
        assert_eq!(inst.strategy(), SchedulingStrategy::Weighted);
        assert_eq!(inst.metrics().strategy, SchedulingStrategy::Weighted);
    }

    #[test]
    fn update_config_replaces_settings_in_one_call() {
        let inst = instance(InstanceConfig::new("i").tick_interval(Duration::from_millis(5)));
        inst.submit(Task::new("a", quick())).unwrap();
        inst.submit(Task::new("b", quick())).unwrap();
        let before = inst.config();

        assert!(inst.update_config(InstanceConfig::new("other")).is_err());
        assert!(inst
            .update_config(InstanceConfig::new("i").max_queue_size(1))
            .is_err());
        assert!(inst
            .update_config(InstanceConfig::new("i").max_concurrent_tasks(0))
            .is_err());
        assert_eq!(inst.config().max_queue_size, before.max_queue_size);

        inst.start().unwrap();
        inst.update_config(
            InstanceConfig::new("i")
                .strategy(SchedulingStrategy::Weighted)
                .max_queue_size(2)
                .max_concurrent_tasks(3)
                .default_timeout(Duration::from_millis(250))
                .tick_interval(Duration::from_millis(10)),
        )
        .unwrap();
        assert!(inst.is_running());

        let config = inst.config();
        assert_eq!(config.strategy, SchedulingStrategy::Weighted);
        assert_eq!(config.max_queue_size, 2);
        assert_eq!(config.default_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.tick_interval, Duration::from_millis(10));
        let m = inst.metrics();
        assert_eq!(m.strategy, SchedulingStrategy::Weighted);
        assert_eq!(m.max_concurrent_tasks, 3);
        assert!(matches!(
            inst.submit(Task::new("c", quick())),
            Err(KilnError::QueueFull { capacity: 2, .. })
        ));
    }

    #[test]
    fn raised_concurrency_budget_takes_effect() {
        let inst = with_resource(InstanceConfig::new("i").max_concurrent_tasks(1), "r1", 2);
        let gate = Gate::default();
        let started = Arc::new(AtomicUsize::new(0));
        let unit = || {
            let started = Arc::clone(&started);
            let open = Arc::clone(&gate.0);
            work_fn(move |_| {
                started.fetch_add(1, Ordering::SeqCst);
                while !open.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(WorkOutput::default())
            })
        };
        inst.submit(Task::new("a", unit())).unwrap();
        inst.submit(Task::new("b", unit())).unwrap();
        assert_eq!(inst.tick().dispatched, 1);

        inst.update_config(InstanceConfig::new("i").max_concurrent_tasks(2))
            .unwrap();
        assert_eq!(inst.tick().dispatched, 1);
        assert!(wait_until(|| started.load(Ordering::SeqCst) == 2));

        gate.open();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
        assert!(wait_for_status(&inst, "b", TaskStatus::Completed));
    }

    #[test]
    fn info_reports_settings_and_gauges() {
        let inst = with_resource(InstanceConfig::new("i").max_concurrent_tasks(2), "r1", 1);
        inst.submit(Task::new("a", quick())).unwrap();

        let info = inst.info();
        assert_eq!(info["id"], "i");
        assert_eq!(info["strategy"], inst.strategy().to_string());
        assert_eq!(info["queue_size"], "1");
        assert_eq!(info["active_tasks"], "0");
        assert_eq!(info["max_concurrent_tasks"], "2");
        assert_eq!(info["resource_count"], "1");
        assert_eq!(info["default_timeout_ms"], "none");
        assert_eq!(info["running"], "false");
        assert_eq!(info["profiling"], "false");
    }

    #[test]
    fn profiling_records_ticks_when_enabled() {
        let inst = with_resource(InstanceConfig::new("i"), "r1", 1);
        inst.tick();
        assert_eq!(inst.profiling_data()["ticks"], 0.0);

        inst.enable_profiling();
        inst.submit(Task::new("a", quick())).unwrap();
        inst.tick();
        inst.tick();
        let data = inst.profiling_data();
        assert_eq!(data["ticks"], 2.0);
        assert_eq!(data["dispatched"], 1.0);
        assert!(data.contains_key("utilization"));
        inst.disable_profiling();
        assert!(!inst.is_profiling_enabled());
    }

    #[test]
    fn background_loop_runs_tasks_and_shutdown_cancels_rest() {
        let inst = with_resource(
            InstanceConfig::new("loop").tick_interval(Duration::from_millis(5)),
            "r1",
            1,
        );
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        inst.start().unwrap();
        inst.start().unwrap();
        assert!(inst.is_running());

        inst.submit(Task::new(
            "a",
            work_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(WorkOutput::default())
            }),
        ))
        .unwrap();
        assert!(wait_for_status(&inst, "a", TaskStatus::Completed));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        inst.set_resource_online("r1", false).unwrap();
        let pending = inst.submit(Task::new("b", quick())).unwrap();
        inst.shutdown();
        inst.shutdown();
        assert!(inst.is_shut_down());
        assert!(!inst.is_running());
        assert_eq!(pending.status(), TaskStatus::Cancelled);
        assert!(inst.submit(Task::new("c", quick())).is_err());
        assert!(inst.start().is_err());
    }
}
