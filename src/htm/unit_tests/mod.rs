#[cfg(test)]
mod coordinator_tests;
#[cfg(test)]
mod isolation_tests;
#[cfg(test)]
mod stall_tests;
