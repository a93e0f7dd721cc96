//! Utilities which make testing future-based code easier.

mod async_assert_eventually;
