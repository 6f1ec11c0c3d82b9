// Integration tests for the actor runtime

use actor::{
    Actor, ActorContext, ActorGroup, ActorRef, ActorState, Error, Flow, GroupConfig, Mail,
    Message, Replyable, Step, configure_default_group, default_group,
};

use dataflow::{DataflowQueue, DataflowVariable};

use tracing_subscriber::EnvFilter;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

fn group(name: &str) -> ActorGroup {
    ActorGroup::new(GroupConfig::default().with_pool_size(4).with_name(name)).unwrap()
}

// Records every message it reacts to.
#[derive(Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl Actor for Recorder {
    type Message = (usize, usize);
    type Reply = usize;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(ctx.loop_forever(|_, ctx| {
            Ok(ctx.react(|recorder: &mut Recorder, message, ctx| {
                let mut seen = recorder.seen.lock().unwrap();
                seen.push(message);
                ctx.reply_if_exists(seen.len());
                Ok(Flow::Continue)
            }))
        }))
    }
}

#[test]
fn test_fifo_per_producer() {
    let group = group("fifo");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = group
        .actor("recorder", Recorder { seen: seen.clone() })
        .unwrap();
    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let recorder = recorder.clone();
            thread::spawn(move || {
                for sequence in 0..500 {
                    recorder.send((producer, sequence)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    recorder.stop().unwrap();
    assert_eq!(recorder.join(), Ok(ActorState::Stopped));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2000);
    let mut last: [Option<usize>; 4] = [None; 4];
    for &(producer, sequence) in seen.iter() {
        assert!(last[producer].is_none_or(|previous| previous < sequence));
        last[producer] = Some(sequence);
    }
}

// Fails the test if two threads ever run its reactions at once.
struct Exclusive {
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    handled: usize,
}

impl Actor for Exclusive {
    type Message = ();
    type Reply = usize;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(ctx.loop_forever(|_, ctx| {
            Ok(ctx.react(|exclusive: &mut Exclusive, _, ctx| {
                if exclusive.busy.swap(true, Ordering::SeqCst) {
                    exclusive.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                exclusive.handled += 1;
                thread::yield_now();
                exclusive.busy.store(false, Ordering::SeqCst);
                ctx.reply_if_exists(exclusive.handled);
                Ok(Flow::Continue)
            }))
        }))
    }
}

#[test]
fn test_at_most_one_active_task() {
    let group = group("exclusive");
    let overlaps = Arc::new(AtomicUsize::new(0));
    let exclusive = group
        .actor(
            "exclusive",
            Exclusive {
                busy: Arc::new(AtomicBool::new(false)),
                overlaps: overlaps.clone(),
                handled: 0,
            },
        )
        .unwrap();
    let senders: Vec<_> = (0..8)
        .map(|_| {
            let exclusive = exclusive.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    exclusive.send(()).unwrap();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }
    assert_eq!(exclusive.send_and_wait(()).unwrap(), 2001);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

// Blocks in receive until something interrupts it.
struct Sleeper {
    interrupted: Arc<AtomicBool>,
}

impl Actor for Sleeper {
    type Message = u8;
    type Reply = u8;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        loop {
            let value = ctx.receive()?;
            ctx.reply_if_exists(value);
        }
    }

    fn on_interrupt(&mut self, _ctx: &mut ActorContext<Self>) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_terminate_interrupts_blocking_receive() {
    let group = group("sleepers");
    let interrupted = Arc::new(AtomicBool::new(false));
    let sleeper = group
        .actor(
            "sleeper",
            Sleeper {
                interrupted: interrupted.clone(),
            },
        )
        .unwrap();
    assert_eq!(sleeper.send_and_wait(9).unwrap(), 9);

    let joiner = {
        let sleeper = sleeper.clone();
        thread::spawn(move || sleeper.join())
    };
    thread::sleep(Duration::from_millis(20));
    sleeper.terminate().unwrap();
    assert_eq!(joiner.join().unwrap(), Ok(ActorState::Terminated));
    assert_eq!(sleeper.state(), ActorState::Terminated);
    assert!(interrupted.load(Ordering::SeqCst));
    // Already finished.
    sleeper.terminate().unwrap();
    assert_eq!(sleeper.send(1), Err(Error::Finished("sleeper".to_owned())));
}

// Blocks its reaction on a variable nobody binds.
struct Gated {
    gate: DataflowVariable<u8>,
    interrupted: Arc<AtomicBool>,
}

impl Actor for Gated {
    type Message = ();
    type Reply = u8;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(ctx.react(|gated: &mut Gated, _, ctx| {
            let value = gated.gate.get()?;
            ctx.reply_if_exists(value);
            Ok(Flow::Stop)
        }))
    }

    fn on_interrupt(&mut self, _ctx: &mut ActorContext<Self>) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_terminate_interrupts_blocking_dataflow_read() {
    let group = group("gates");
    let gate = DataflowVariable::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    let gated = group
        .actor(
            "gated",
            Gated {
                gate: gate.clone(),
                interrupted: interrupted.clone(),
            },
        )
        .unwrap();
    gated.send(()).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(gated.state(), ActorState::Running);

    gated.terminate().unwrap();
    assert_eq!(
        gated.join_timeout(Duration::from_secs(2)),
        Ok(ActorState::Terminated)
    );
    assert!(interrupted.load(Ordering::SeqCst));
    assert!(!gate.is_bound());
    assert_eq!(gated.send(()), Err(Error::Finished("gated".to_owned())));
}

#[test]
fn test_blocking_receiver_under_load_leaves_the_pool_usable() {
    let group = ActorGroup::new(
        GroupConfig::default()
            .with_pool_size(3)
            .with_name("loaded"),
    )
    .unwrap();
    let echo = group
        .actor(
            "echo",
            Sleeper {
                interrupted: Arc::new(AtomicBool::new(false)),
            },
        )
        .unwrap();
    let senders: Vec<_> = (0..4u8)
        .map(|sender| {
            let echo = echo.clone();
            thread::spawn(move || {
                for round in 0..500u32 {
                    let value = sender.wrapping_add(round as u8);
                    assert_eq!(echo.send_and_wait(value).unwrap(), value);
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    let doubler = group.reactor("doubler", |value: u32| value * 2).unwrap();
    assert_eq!(
        doubler.send_and_wait_timeout(7, Duration::from_secs(2)),
        Ok(14)
    );
    echo.stop().unwrap();
    assert_eq!(
        echo.join_timeout(Duration::from_secs(2)),
        Ok(ActorState::Stopped)
    );
}

#[test]
fn test_terminate_idle_and_unstarted_actors() {
    let group = group("idle");
    let idle = group.actor("idle", Recorder::default()).unwrap();
    assert_eq!(idle.send_and_wait((0, 0)).unwrap(), 1);
    idle.terminate().unwrap();
    assert_eq!(idle.join(), Ok(ActorState::Terminated));

    let unstarted = group.create("unstarted", Recorder::default());
    unstarted.terminate().unwrap();
    assert_eq!(
        unstarted.join_timeout(Duration::from_secs(5)),
        Ok(ActorState::Terminated)
    );
    assert_eq!(
        unstarted.start(),
        Err(Error::AlreadyStarted("unstarted".to_owned()))
    );
}

#[test]
fn test_stop_after_terminate_is_a_noop() {
    let group = group("stopping");
    let recorder = group.actor("recorder", Recorder::default()).unwrap();
    recorder.terminate().unwrap();
    recorder.stop().unwrap();
    assert_eq!(recorder.join(), Ok(ActorState::Terminated));
}

// Counts timeouts and keeps reacting after each one.
struct Watchdog {
    timeouts: Arc<AtomicUsize>,
    received: DataflowVariable<&'static str>,
}

impl Watchdog {
    fn watch(ctx: &mut ActorContext<Self>) -> Flow<Self> {
        ctx.react_for(Duration::from_millis(50), |watchdog: &mut Watchdog, message, _| {
            watchdog.received.bind(message)?;
            Ok(Flow::Stop)
        })
    }
}

impl Actor for Watchdog {
    type Message = &'static str;
    type Reply = ();

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(Watchdog::watch(ctx))
    }

    fn on_timeout(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        if self.timeouts.fetch_add(1, Ordering::SeqCst) == 0 {
            // Wait without a timeout after the first one.
            Ok(ctx.react(|watchdog: &mut Watchdog, message, _| {
                watchdog.received.bind(message)?;
                Ok(Flow::Stop)
            }))
        } else {
            Ok(Watchdog::watch(ctx))
        }
    }
}

#[test]
fn test_timeout_fires_once_and_keeps_late_message() {
    let group = group("watchdogs");
    let timeouts = Arc::new(AtomicUsize::new(0));
    let received = DataflowVariable::new();
    let watchdog = group
        .actor(
            "watchdog",
            Watchdog {
                timeouts: timeouts.clone(),
                received: received.clone(),
            },
        )
        .unwrap();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    watchdog.send("late").unwrap();
    assert_eq!(received.get(), Ok("late"));
    assert_eq!(watchdog.join(), Ok(ActorState::Stopped));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_timeout_defaults_to_termination() {
    struct Impatient;

    impl Actor for Impatient {
        type Message = ();
        type Reply = ();

        fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
            Ok(ctx.react_for(Duration::from_millis(10), |_, _, _| Ok(Flow::Stop)))
        }
    }

    let group = group("impatient");
    let impatient = group.actor("impatient", Impatient).unwrap();
    assert_eq!(impatient.join(), Ok(ActorState::Terminated));
}

#[test]
fn test_double_start_and_double_stop() {
    let group = group("lifecycle");
    let recorder = group.create("recorder", Recorder::default());
    assert_eq!(recorder.state(), ActorState::NotStarted);
    assert!(!recorder.is_active());
    recorder.start().unwrap();
    assert!(recorder.is_active());
    assert_eq!(
        recorder.start(),
        Err(Error::AlreadyStarted("recorder".to_owned()))
    );
    recorder.stop().unwrap();
    recorder.stop().unwrap();
    assert_eq!(recorder.join(), Ok(ActorState::Stopped));
    recorder.stop().unwrap();
    assert_eq!(recorder.state(), ActorState::Stopped);
}

// Collects the messages left in the mailbox when it stops.
struct Batcher {
    undelivered: DataflowVariable<Vec<u32>>,
}

impl Actor for Batcher {
    type Message = u32;
    type Reply = u32;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(ctx.loop_times(2, |_, ctx| {
            Ok(ctx.react_many(2, |_: &mut Batcher, values, ctx| {
                ctx.reply(values.iter().sum())?;
                Ok(Flow::Continue)
            }))
        }))
    }

    fn after_stop(&mut self, undelivered: Vec<Mail<Self>>) {
        let values = undelivered.iter().map(|mail| *mail.payload()).collect();
        self.undelivered.bind_safely(values);
    }
}

#[test]
fn test_react_many_loop_times_and_undelivered() {
    let group = group("batches");
    let undelivered = DataflowVariable::new();
    let batcher = group.create(
        "batcher",
        Batcher {
            undelivered: undelivered.clone(),
        },
    );
    let replies: DataflowQueue<u32> = DataflowQueue::new();
    for value in 1..=6 {
        batcher
            .send_with_reply_to(value, Arc::new(replies.clone()))
            .unwrap();
    }
    batcher.start().unwrap();
    assert_eq!(batcher.join(), Ok(ActorState::Stopped));
    // Each batch answers both of its senders.
    let answers: Vec<u32> = (0..4).map(|_| replies.get_val().unwrap()).collect();
    assert_eq!(answers, vec![3, 3, 7, 7]);
    assert_eq!(undelivered.get(), Ok(vec![5, 6]));
}

#[test]
fn test_send_and_wait_reports_undelivered_message() {
    struct Quitter;

    impl Actor for Quitter {
        type Message = u8;
        type Reply = u8;

        fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
            Ok(ctx.react(|_, _, _| Ok(Flow::Stop)))
        }
    }

    let group = group("quitters");
    let quitter = group.create("quitter", Quitter);
    quitter.send(1).unwrap();
    let waiter = {
        let quitter = quitter.clone();
        thread::spawn(move || quitter.send_and_wait(2))
    };
    thread::sleep(Duration::from_millis(20));
    quitter.start().unwrap();
    assert_eq!(
        waiter.join().unwrap(),
        Err(Error::Finished("quitter".to_owned()))
    );
    assert_eq!(
        quitter.send_and_wait_timeout(3, Duration::from_millis(10)),
        Err(Error::Finished("quitter".to_owned()))
    );
}

// Replies with the sum of everything received so far, using blocking receive.
struct Summer;

impl Actor for Summer {
    type Message = u64;
    type Reply = u64;

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        let mut total = 0;
        while let Some(value) = ctx.receive_timeout(Duration::from_millis(200))? {
            total += value;
            ctx.reply(total)?;
        }
        Ok(Flow::Stop)
    }
}

#[test]
fn test_blocking_receive_and_reply() {
    let group = group("summers");
    let summer = group.actor("summer", Summer).unwrap();
    assert_eq!(summer.send_and_wait(1).unwrap(), 1);
    assert_eq!(summer.send_and_wait(2).unwrap(), 3);
    // Without a sender, reply fails and the actor terminates.
    summer.send(3).unwrap();
    assert_eq!(summer.join(), Ok(ActorState::Terminated));
}

#[test]
fn test_stop_reaches_blocking_receive() {
    let group = group("summers");
    let summer = group.actor("summer", Summer).unwrap();
    assert_eq!(summer.send_and_wait(5).unwrap(), 5);
    summer.stop().unwrap();
    assert_eq!(summer.join(), Ok(ActorState::Stopped));
}

// Forwards each message to another actor, asking it to reply to us.
struct Relay {
    target: ActorRef<Recorder>,
    replies: DataflowQueue<usize>,
}

#[derive(Debug)]
enum RelayMessage {
    Forward(usize),
    Count(usize),
}

impl Message for RelayMessage {}

impl Actor for Relay {
    type Message = RelayMessage;
    type Reply = ();

    fn act(&mut self, ctx: &mut ActorContext<Self>) -> Step<Self> {
        Ok(ctx.loop_while(
            |relay: &Relay| relay.replies.len() < 3,
            |_, ctx| {
                Ok(ctx.react(|relay: &mut Relay, message, ctx| {
                    match message {
                        RelayMessage::Forward(value) => {
                            let me = ctx.myself()?;
                            let reply_to = Arc::new(CountReply { relay: me });
                            relay.target.send_with_reply_to((0, value), reply_to)?;
                        }
                        RelayMessage::Count(count) => relay.replies.write(count),
                    }
                    Ok(Flow::Continue)
                }))
            },
        ))
    }
}

// Wraps the recorder's answers into relay messages.
struct CountReply {
    relay: ActorRef<Relay>,
}

impl Replyable<usize> for CountReply {
    fn reply(&self, reply: usize) -> Result<(), Error> {
        self.relay.send(RelayMessage::Count(reply))
    }
}

#[test]
fn test_actor_replies_to_actor() {
    let group = group("relays");
    let recorder = group.actor("recorder", Recorder::default()).unwrap();
    let replies = DataflowQueue::new();
    let relay = group
        .actor(
            "relay",
            Relay {
                target: recorder.clone(),
                replies: replies.clone(),
            },
        )
        .unwrap();
    for value in 0..3 {
        relay.send(RelayMessage::Forward(value)).unwrap();
    }
    assert_eq!(relay.join(), Ok(ActorState::Stopped));
    let counts: Vec<usize> = (0..3).map(|_| replies.get_val().unwrap()).collect();
    assert_eq!(counts, vec![1, 2, 3]);
}

#[test]
fn test_reactor_and_send_and_continue() {
    let group = group("reactors");
    let upper = group
        .reactor("upper", |text: String| text.to_uppercase())
        .unwrap();
    let result = DataflowVariable::new();
    let target = result.clone();
    upper
        .send_and_continue("braid".to_owned(), move |reply| {
            target.bind(reply).unwrap();
        })
        .unwrap();
    assert_eq!(result.get(), Ok("BRAID".to_owned()));

    let finished = DataflowVariable::new();
    let target = finished.clone();
    upper.when_finished(move |state| {
        target.bind(state).unwrap();
    });
    upper.stop().unwrap();
    assert_eq!(finished.get(), Ok(ActorState::Stopped));
}

#[test]
fn test_actor_ref_as_reply_address() {
    let group = group("addresses");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = group
        .actor("recorder", Recorder { seen: seen.clone() })
        .unwrap();
    recorder.reply_to().reply((7, 7)).unwrap();
    assert_eq!(recorder.send_and_wait((8, 8)).unwrap(), 2);
    assert_eq!(*seen.lock().unwrap(), vec![(7, 7), (8, 8)]);
    assert_eq!(format!("{:?}", recorder), "ActorRef { name: \"recorder\", state: Running }");
}

#[test]
fn test_default_group_is_configured_once() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
    let config = GroupConfig::default().with_pool_size(2).with_name("default-test");
    configure_default_group(config.clone()).unwrap();
    assert!(matches!(
        configure_default_group(config),
        Err(Error::IllegalArgument(_))
    ));
    let group = default_group().unwrap();
    assert_eq!(group.name(), "default-test");
    assert_eq!(group.pool().size(), 2);
    assert!(matches!(
        configure_default_group(GroupConfig::default()),
        Err(Error::IllegalArgument(_))
    ));
    let echo = group.reactor("echo", |value: i32| -value).unwrap();
    assert_eq!(echo.send_and_wait(4).unwrap(), -4);
}

#[tokio::test]
async fn test_finished_from_async_code() {
    let group = group("async");
    let recorder = group.actor("recorder", Recorder::default()).unwrap();
    recorder.send((1, 1)).unwrap();
    recorder.stop().unwrap();
    assert_eq!(recorder.finished().await, ActorState::Stopped);
    group.shutdown();
}
