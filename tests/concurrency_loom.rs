#![cfg(loom)]
//! Acknowledgment and retry sweep racing on one pending entry.
//!
//! `loom` explores the interleavings of an acknowledgment arriving while the
//! sweep expires the same message; exactly one side may apply the terminal
//! transition and take the callback.

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};
use hyperroute::{
    DeliveryReport,
    Message,
    MessageType,
    NodeId,
    PeerPointer,
    SendInfo,
    ack::PendingAck,
};
use tokio::time::Instant;

fn pending(fired: &Arc<AtomicUsize>) -> PendingAck {
    let local = PeerPointer::new(NodeId::from_u64(1), "node-1");
    let message = Message::builder(MessageType::Data, &local, NodeId::from_u64(2))
        .serial(3)
        .build();
    let fired = Arc::clone(fired);
    PendingAck::new(
        SendInfo::local(message),
        1,
        Instant::now(),
        Some(Box::new(move |_: DeliveryReport| {
            fired.fetch_add(1, Ordering::SeqCst);
        })),
    )
}

#[test]
fn terminal_transition_happens_once() {
    model(|| {
        let fired = Arc::new(AtomicUsize::new(0));
        let entry = Arc::new(pending(&fired));

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || entry.finish().map(|(callback, _)| callback.is_some()))
            })
            .collect();
        let winners: Vec<_> = racers
            .into_iter()
            .map(|racer| racer.join().expect("racer panicked"))
            .collect();

        assert_eq!(winners.iter().filter(|w| w.is_some()).count(), 1);
        assert_eq!(winners.iter().flatten().filter(|has| **has).count(), 1);
        assert!(entry.is_processed());
        assert_eq!(fired.load(Ordering::SeqCst), 0, "callbacks run on the dispatcher");
    });
}
