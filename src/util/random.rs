use rand::{Rng, RngCore};
use std::ops::Range;
#[cfg(test)] use std::sync::Mutex;



#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

/// Source of randomness for shuffles, gather sampling and packet ids. This is
/// not key material - it only needs to be unpredictable enough that an
/// off-path observer cannot steer member selection.
///
/// NB: Everything generic over a Random is shared across worker threads,
///  hence the bounds.
#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync + 'static {
    fn next_u64() -> u64;
    fn gen_usize_range(range: Range<usize>) -> usize;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u64() -> u64 {
        rand::thread_rng().next_u64()
    }

    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}
