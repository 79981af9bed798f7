//! Scheduling behaviour of the step graph: ordering, exactly-once
//! execution, failure propagation and edge validation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use layerbake::step::{AsyncStep, StepPool};
use layerbake::Error;

fn counted(pool: &StepPool, name: &str, value: u32, runs: &Arc<AtomicUsize>) -> AsyncStep<u32> {
    let runs = Arc::clone(runs);
    pool.step(name, move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    })
}

#[test]
fn dependency_results_are_ready_when_dependent_starts() {
    let pool = StepPool::new(2).unwrap();
    let a = pool.step("a", || async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(20u32)
    });
    let b = {
        let a = a.clone();
        pool.step("b", move || async move { Ok(*a.result()? + 1) })
    };
    let c = {
        let (a, b) = (a.clone(), b.clone());
        pool.step("c", move || async move { Ok(*a.result()? + *b.result()?) })
    };
    b.depends_on(&[&a]).unwrap();
    c.depends_on(&[&a, &b]).unwrap();

    c.run().unwrap();
    assert_eq!(*c.result().unwrap(), 41);
    assert!(a.is_finished());
    assert!(b.is_finished());
}

#[test]
fn diamond_runs_each_step_once() {
    let pool = StepPool::new(4).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let root = counted(&pool, "root", 1, &runs);
    let left = counted(&pool, "left", 2, &runs);
    let right = counted(&pool, "right", 3, &runs);
    let sink = counted(&pool, "sink", 4, &runs);
    left.depends_on(&[&root]).unwrap();
    right.depends_on(&[&root]).unwrap();
    sink.depends_on(&[&left, &right]).unwrap();

    sink.run().unwrap();
    sink.run().unwrap();
    left.run().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 4);
}

#[test]
fn steps_start_only_after_all_dependencies_finish() {
    let pool = StepPool::new(4).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let record = |name: &'static str, delay: u64| {
        let log = Arc::clone(&log);
        pool.step(name, move || async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            log.lock().unwrap().push(name);
            Ok(())
        })
    };
    let slow = record("slow", 40);
    let fast = record("fast", 0);
    let last = record("last", 0);
    last.depends_on(&[&slow, &fast]).unwrap();

    last.run().unwrap();
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log[2], "last");
}

#[test]
fn independent_steps_run_concurrently() {
    let pool = StepPool::new(2).unwrap();
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let wait = |name: &'static str| {
        let barrier = Arc::clone(&barrier);
        pool.step(name, move || async move {
            barrier.wait().await;
            Ok(())
        })
    };
    let left = wait("left");
    let right = wait("right");
    let join = pool.step("join", || async { Ok(()) });
    join.depends_on(&[&left, &right]).unwrap();

    join.run().unwrap();
}

#[test]
fn failure_reaches_every_transitive_dependent() {
    let pool = StepPool::new(2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let broken: AsyncStep<u32> = pool.step("broken", || async {
        Err(Error::Runtime("registry unreachable".into()))
    });
    let middle = counted(&pool, "middle", 1, &runs);
    let top = counted(&pool, "top", 2, &runs);
    middle.depends_on(&[&broken]).unwrap();
    top.depends_on(&[&middle]).unwrap();

    match top.run().unwrap_err() {
        Error::StepFailed { step, source } => {
            assert_eq!(step, "broken");
            assert!(matches!(*source, Error::Runtime(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(middle.run(), Err(Error::StepFailed { .. })));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(matches!(top.result(), Err(Error::StepNotFinished(_))));
}

#[test]
fn result_before_completion_is_not_finished() {
    let pool = StepPool::new(1).unwrap();
    let step = pool.step("later", || async { Ok(1u32) });
    assert!(matches!(step.result(), Err(Error::StepNotFinished(name)) if name == "later"));
}

#[test]
fn rejects_self_dependency() {
    let pool = StepPool::new(1).unwrap();
    let step = pool.step("loop", || async { Ok(()) });
    assert!(matches!(step.depends_on(&[&step]), Err(Error::SelfDependency(_))));
}

#[test]
fn rejects_cycles() {
    let pool = StepPool::new(1).unwrap();
    let a = pool.step("a", || async { Ok(()) });
    let b = pool.step("b", || async { Ok(()) });
    let c = pool.step("c", || async { Ok(()) });
    b.depends_on(&[&a]).unwrap();
    c.depends_on(&[&b]).unwrap();

    match a.depends_on(&[&c]).unwrap_err() {
        Error::DependencyCycle { step, dependency } => {
            assert_eq!(step, "a");
            assert_eq!(dependency, "c");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(a.dependencies().is_empty());
}

#[test]
fn rejects_edges_after_scheduling() {
    let pool = StepPool::new(1).unwrap();
    let a = pool.step("a", || async { Ok(()) });
    let b = pool.step("b", || async { Ok(()) });
    b.run().unwrap();
    assert!(matches!(b.depends_on(&[&a]), Err(Error::AlreadyScheduled(_))));
}

#[test]
fn complete_awaits_without_blocking_the_pool() {
    let pool = StepPool::new(1).unwrap();
    let a = pool.step("a", || async { Ok(String::from("layer")) });
    let b = {
        let a = a.clone();
        pool.step("b", move || async move { Ok(a.result()?.len()) })
    };
    b.depends_on(&[&a]).unwrap();

    let value = tokio_test::block_on(b.complete()).unwrap();
    assert_eq!(*value, 5);
}

#[test]
fn run_refuses_to_block_inside_async_context() {
    let pool = StepPool::new(1).unwrap();
    let step = pool.step("a", || async { Ok(()) });
    let err = tokio_test::block_on(async { step.run() }).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
}
