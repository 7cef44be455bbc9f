use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use skein_core::{
    connect, watch_chain, Message, Port, Process, ProgressEvent, ProgressMonitor, RuntimeConfiguration, Scheduler,
    TaskId, TaskState, WatchMode,
};

fn scheduler(name: &str) -> Scheduler {
    Scheduler::new(RuntimeConfiguration {
        min_threads: 2,
        max_threads: 8,
        progress_interval_ms: 0,
        thread_name: name.to_string(),
        ..Default::default()
    })
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn drain_events(port: &Port) -> HashMap<TaskId, Vec<ProgressEvent>> {
    let mut events: HashMap<TaskId, Vec<ProgressEvent>> = HashMap::new();
    while let Some(message) = port.pop() {
        if let Some((source, event)) = ProgressEvent::from_message(&message) {
            events.entry(source).or_default().push(event);
        }
    }
    events
}

#[test]
fn every_item_is_processed_exactly_once() {
    const ITEMS: i32 = 1_000;

    let scheduler = scheduler("exactly-once");
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new((0..ITEMS).map(|_| AtomicBool::new(false)).collect::<Vec<_>>());

    let process = {
        let counter = Arc::clone(&counter);
        let seen = Arc::clone(&seen);
        Process::builder()
            .scheduler(scheduler.clone())
            .build(move |_: &Process, item: Message| {
                counter.fetch_add(1, Ordering::SeqCst);
                let already = seen[item.get_int("index") as usize].swap(true, Ordering::SeqCst);
                assert!(!already, "item processed twice");
                Ok(())
            })
    };

    process.run();
    let producers = (0..4)
        .map(|p| {
            let process = process.clone();
            thread::spawn(move || {
                for index in (p..ITEMS).step_by(4) {
                    process
                        .enqueue(Message::new_full(0, [("index", index)]))
                        .expect("process accepts work");
                }
            })
        })
        .collect::<Vec<_>>();
    for producer in producers {
        producer.join().expect("producer should not panic");
    }
    process.no_more_work();

    assert!(wait_until(Duration::from_secs(30), || process.is_finished()));
    assert_eq!(counter.load(Ordering::SeqCst), ITEMS as usize);
    assert!(seen.iter().all(|flag| flag.load(Ordering::SeqCst)));

    thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.load(Ordering::SeqCst), ITEMS as usize);
}

#[test]
fn recursion_terminates_at_one_hundred_and_one() {
    for round in 0..5 {
        let scheduler = scheduler("recursion");
        let counter = Arc::new(AtomicUsize::new(0));
        let process = {
            let counter = Arc::clone(&counter);
            Process::builder()
                .scheduler(scheduler.clone())
                .build(move |process: &Process, _: Message| {
                    if counter.load(Ordering::SeqCst) < 50 {
                        process.recurse(Message::new(0));
                        process.recurse(Message::new(0));
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
        };

        process.run();
        process.enqueue(Message::new(0)).expect("process accepts work");
        process.no_more_work();

        assert!(wait_until(Duration::from_secs(10), || process.is_finished()), "round {}", round);
        assert_eq!(counter.load(Ordering::SeqCst), 101, "round {}", round);
    }
}

#[test]
fn head_finishes_after_tail() {
    const ITEMS: usize = 200;

    let scheduler = scheduler("forwarding");
    let processed = Arc::new(AtomicUsize::new(0));
    let tail_done_first = Arc::new(AtomicBool::new(false));

    let head = Process::builder()
        .scheduler(scheduler.clone())
        .title("head")
        .build(|process: &Process, item: Message| {
            let mut doubled = item.copy();
            doubled.set_int("value", item.get_int("value") * 2);
            process.forward(doubled);
            Ok(())
        });
    let tail = {
        let processed = Arc::clone(&processed);
        Process::builder()
            .scheduler(scheduler.clone())
            .title("tail")
            .build(move |_: &Process, item: Message| {
                assert_eq!(item.get_int("value") % 2, 0);
                processed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
    };
    connect(&head, &tail).expect("processes should connect");

    {
        let tail = tail.clone();
        let tail_done_first = Arc::clone(&tail_done_first);
        head.as_task().add_callback(move |_| {
            tail_done_first.store(tail.as_task().is_finished(), Ordering::SeqCst);
        });
    }

    head.run();
    for value in 0..ITEMS as i32 {
        head.enqueue(Message::new_full(0, [("value", value)]))
            .expect("process accepts work");
    }
    head.no_more_work();

    assert!(wait_until(Duration::from_secs(30), || head.is_finished()));
    assert!(tail.is_finished());
    assert_eq!(processed.load(Ordering::SeqCst), ITEMS);
    assert_eq!(tail.processed_items(), ITEMS);
    assert!(wait_until(Duration::from_secs(10), || tail_done_first.load(Ordering::SeqCst)));
}

#[test]
fn drained_head_waits_for_slow_tail() {
    const ITEMS: usize = 10;

    let scheduler = scheduler("slow-tail");
    let head = Process::builder()
        .scheduler(scheduler.clone())
        .build(|process: &Process, item: Message| {
            process.forward(item);
            Ok(())
        });
    let tail = Process::builder()
        .scheduler(scheduler.clone())
        .build(|_: &Process, _: Message| {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        });
    connect(&head, &tail).expect("processes should connect");

    head.run();
    for i in 0..ITEMS as i32 {
        head.enqueue(Message::new(i)).expect("process accepts work");
    }
    head.no_more_work();

    assert!(wait_until(Duration::from_secs(10), || head.processed_items() == ITEMS));
    thread::sleep(Duration::from_millis(20));
    assert!(tail.processed_items() < ITEMS);
    assert_eq!(head.state(), TaskState::Executing);
    assert!(!head.is_finished());

    assert!(wait_until(Duration::from_secs(10), || head.state() == TaskState::Finished));
    assert_eq!(tail.state(), TaskState::Finished);
    assert_eq!(tail.processed_items(), ITEMS);
}

#[test]
fn canceling_any_process_terminates_the_chain() {
    for victim in 0..3 {
        let scheduler = scheduler("chain-cancel");
        let stages = (0..3)
            .map(|stage| {
                Process::builder()
                    .scheduler(scheduler.clone())
                    .title(format!("stage-{}", stage))
                    .build(|process: &Process, item: Message| {
                        thread::sleep(Duration::from_millis(5));
                        if process.has_successor() {
                            process.forward(item);
                        }
                        Ok(())
                    })
            })
            .collect::<Vec<_>>();
        connect(&stages[0], &stages[1]).expect("processes should connect");
        connect(&stages[1], &stages[2]).expect("processes should connect");

        let port = Port::new();
        assert_eq!(watch_chain(&stages[0], &port, WatchMode::ItemCount), 3);

        stages[0].run();
        for i in 0..100 {
            stages[0].enqueue(Message::new(i)).expect("process accepts work");
        }
        stages[0].no_more_work();
        thread::sleep(Duration::from_millis(20));
        stages[victim].cancel();

        assert!(
            wait_until(Duration::from_secs(10), || stages.iter().all(Process::is_terminal)),
            "victim {}",
            victim
        );
        assert_eq!(stages[victim].state(), TaskState::Canceled);

        // Give any straggling events a chance to show up.
        thread::sleep(Duration::from_millis(50));
        let events = drain_events(&port);
        for stage in &stages {
            let events = events.get(&stage.id()).expect("every stage reports progress");
            let terminal = events
                .iter()
                .position(ProgressEvent::is_terminal)
                .expect("every stage reports a terminal event");
            assert_eq!(terminal, events.len() - 1, "events after terminal for victim {}", victim);
        }
    }
}

#[test]
fn monitor_tracks_a_chain() {
    let scheduler = scheduler("monitor");
    let head = Process::builder()
        .scheduler(scheduler.clone())
        .title("parse")
        .build(|process: &Process, item: Message| {
            process.forward(item);
            Ok(())
        });
    let tail = Process::builder()
        .scheduler(scheduler.clone())
        .title("store")
        .build(|_: &Process, _: Message| Ok(()));
    connect(&head, &tail).expect("processes should connect");

    let mut monitor = ProgressMonitor::new(WatchMode::ItemCount);
    monitor.watch_process_chain(&head);
    assert_eq!(monitor.watches().count(), 2);

    head.run();
    for i in 0..10 {
        head.enqueue(Message::new(i)).expect("process accepts work");
    }
    head.no_more_work();

    assert!(wait_until(Duration::from_secs(10), || {
        monitor.pump();
        monitor.is_finished()
    }));

    let tail_watch = monitor.watch(tail.id()).expect("tail is watched");
    assert!(tail_watch.is_complete());
    assert_eq!(tail_watch.title(), Some("store"));
    assert_eq!(tail_watch.processed_items(), 10);
    assert_eq!(tail_watch.total_items(), 10);
    assert_eq!(tail_watch.fraction(), 1.0);

    // Terminal state is sticky.
    assert_eq!(monitor.pump(), 0);
    assert!(monitor.is_finished());
}

#[test]
fn monitor_cancels_everything_it_watches() {
    let scheduler = scheduler("monitor-cancel");
    let head = Process::builder()
        .scheduler(scheduler.clone())
        .build(|process: &Process, item: Message| {
            thread::sleep(Duration::from_millis(5));
            process.forward(item);
            Ok(())
        });
    let tail = Process::builder()
        .scheduler(scheduler.clone())
        .build(|_: &Process, _: Message| {
            thread::sleep(Duration::from_millis(5));
            Ok(())
        });
    connect(&head, &tail).expect("processes should connect");

    let mut monitor = ProgressMonitor::new(WatchMode::Percentage);
    monitor.watch_process_chain(&head);
    head.run();
    for i in 0..100 {
        head.enqueue(Message::new(i)).expect("process accepts work");
    }

    monitor.cancel();
    assert!(wait_until(Duration::from_secs(10), || {
        monitor.pump();
        monitor.is_finished()
    }));

    assert_eq!(head.state(), TaskState::Canceled);
    assert_eq!(tail.state(), TaskState::Canceled);
    assert!(monitor.watches().all(|watch| watch.is_cancelled() && !watch.is_complete()));
    assert!(head.processed_items() < 100);
}
