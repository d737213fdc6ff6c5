use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;

use edge_scan::queue::ResponsiveQueue;
use edge_scan::types::AddressRecord;
use rand::Rng;
use time::OffsetDateTime;

const CEILING: Duration = Duration::from_millis(300);
const TTL: Duration = Duration::from_secs(30);

#[test]
fn invariants_hold_under_random_traffic() {
    let q = ResponsiveQueue::new(6, TTL, CEILING);
    let mut rng = rand::thread_rng();
    let start = OffsetDateTime::now_utc();

    for step in 0..5_000i64 {
        let now = start + time::Duration::milliseconds(step * 20);
        let ip = IpAddr::from([172, 16, 0, rng.gen_range(0..40)]);
        let rtt = Duration::from_millis(rng.gen_range(1..500));
        q.insert(AddressRecord::observed_at(ip, 443, rtt, now));
        if step % 50 == 0 {
            q.expire(now);
            assert!(q.snapshot(false).iter().all(|r| r.age(now) <= TTL));
        }

        let snap = q.snapshot(false);
        assert!(snap.len() <= 6);
        assert!(snap.iter().all(|r| r.rtt() <= CEILING));
        assert!(snap.windows(2).all(|w| w[0].rtt_ms <= w[1].rtt_ms));
        assert_eq!(snap.iter().map(|r| r.ip).collect::<HashSet<_>>().len(), snap.len());

        let mut desc = q.snapshot(true);
        desc.reverse();
        assert_eq!(desc, snap);
    }
}

#[test]
fn probed_port_is_kept_verbatim() {
    let q = ResponsiveQueue::new(4, TTL, CEILING);
    let ip: IpAddr = "162.159.192.1".parse().unwrap();
    q.insert(AddressRecord::new(ip, 2408, Duration::from_millis(90)));
    q.insert(AddressRecord::new(ip, 4500, Duration::from_millis(40)));
    let pool = q.snapshot(false);
    assert_eq!(pool.len(), 1);
    assert_eq!((pool[0].port, pool[0].rtt_ms), (4500, 40));
}
