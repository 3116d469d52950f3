//! Reliable messaging for named groups of peers on a shared multicast network.
//!
//! Processes join groups with one or more local members. Messages of arbitrary size are
//!  fragmented into datagrams and re-sent until every remote member of the group acknowledged
//!  every packet. Membership is maintained through periodic announcements, and remote members
//!  that go silent are evicted based on a group-wide approximation of wall clock time.
//!
//! [groups::Groups] is the entry point. The network is abstracted as a [transport::Transport],
//!  with an IP multicast implementation and an in-process loopback network for testing.

pub mod config;
pub mod dispatcher;
pub mod groups;
pub mod ids;
pub mod membership;
pub mod message;
pub mod net_time;
pub mod packet;
pub mod test_util;
pub mod transport;
pub mod util;
