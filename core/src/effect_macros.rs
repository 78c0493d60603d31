//! Declarative macros for ergonomic effect construction
//!
//! These macros reduce boilerplate when creating `Effect` variants in reducers.

/// Create an `Effect::Future` from an async block
///
/// # Example
///
/// ```rust,ignore
/// use slotbook_core::async_effect;
///
/// async_effect! {
///     let order = gateway.create_order(request).await;
///     Some(BookingAction::GatewayOrderCreated { order })
/// }
/// ```
#[macro_export]
macro_rules! async_effect {
    ($($body:tt)*) => {
        $crate::effect::Effect::Future(
            ::std::boxed::Box::pin(async move { $($body)* })
        )
    };
}

/// Create an `Effect::Delay` for scheduling delayed actions
///
/// # Example
///
/// ```rust,ignore
/// use slotbook_core::delay;
/// use std::time::Duration;
///
/// delay! {
///     duration: Duration::from_secs(600),
///     action: BookingAction::ExpireSlotLock { slot }
/// }
/// ```
#[macro_export]
macro_rules! delay {
    (
        duration: $duration:expr,
        action: $action:expr
    ) => {
        $crate::effect::Effect::Delay {
            duration: $duration,
            action: ::std::boxed::Box::new($action),
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::effect::Effect;
    use std::time::Duration;

    #[derive(Clone, Debug)]
    #[allow(dead_code)]
    enum TestAction {
        AsyncResult { value: i32 },
        TimeoutExpired,
    }

    #[test]
    fn test_async_effect_macro() {
        let effect = async_effect! {
            Some(TestAction::AsyncResult { value: 42 })
        };

        assert!(matches!(effect, Effect::Future(_)));
    }

    #[test]
    fn test_delay_macro() {
        let effect = delay! {
            duration: Duration::from_secs(600),
            action: TestAction::TimeoutExpired
        };

        match effect {
            Effect::Delay { duration, action } => {
                assert_eq!(duration, Duration::from_secs(600));
                assert!(matches!(*action, TestAction::TimeoutExpired));
            },
            other => unreachable!("expected delay, got {other:?}"),
        }
    }
}
