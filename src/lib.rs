pub mod multicast;
pub mod protocol;
pub mod switch;
pub mod topology;
pub mod util;
pub mod test_util;
