/// Periodically check if a value becomes the expected value within a maximum number of attempts.
/// Polls on an interval via `tokio::time::sleep` rather than `thread::sleep`, so it must run inside
/// a tokio runtime.
///
/// ```nocompile
/// let some_var = 123;
/// async_assert_eventually!(
///    some_var + 1,
///    expect = 124,
///    max_attempts = 10,
///    interval = Duration::from_millis(500)
/// );
/// ```
#[macro_export]
macro_rules! async_assert_eventually {
    ($check_expr:expr, expect = $expect:expr, max_attempts = $max_attempts:expr, interval = $interval:expr $(,)?) => {{
        let mut value = $check_expr;
        let mut attempts = 0;
        while value != $expect {
            attempts += 1;
            if attempts > $max_attempts {
                panic!(
                    "assert_eventually assertion failed. Expression did not equal value after {} attempts.",
                    $max_attempts
                );
            }
            tokio::time::sleep($interval).await;
            value = $check_expr;
        }
    }};

    ($check_expr:expr, expect = $expect:expr, max_attempts = $max_attempts:expr $(,)?) => {{
        $crate::async_assert_eventually!(
            $check_expr,
            expect = $expect,
            max_attempts = $max_attempts,
            interval = std::time::Duration::from_millis(100)
        );
    }};

    ($check_expr:expr, expect = $expect:expr $(,)?) => {{
        $crate::async_assert_eventually!(
            $check_expr,
            expect = $expect,
            max_attempts = 10,
            interval = std::time::Duration::from_millis(100)
        );
    }};
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn resolves_once_the_value_catches_up() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        async_assert_eventually!(counter.load(Ordering::SeqCst), expect = 5, max_attempts = 50, interval = std::time::Duration::from_millis(5));
    }
}
