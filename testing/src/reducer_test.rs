//! Ergonomic testing utilities for reducers
//!
//! This module provides a fluent API for testing reducers with readable Given-When-Then syntax.

#![allow(clippy::module_name_repetitions)] // ReducerTest is the natural name

use slotbook_core::{effect::Effect, reducer::Reducer};

/// Type alias for state assertion functions
type StateAssertion<S> = Box<dyn FnOnce(&S)>;

/// Type alias for effect assertion functions
type EffectAssertion<A> = Box<dyn FnOnce(&[Effect<A>])>;

/// Fluent API for testing reducers with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use slotbook_testing::ReducerTest;
///
/// ReducerTest::new(BookingReducer)
///     .with_env(test_environment())
///     .given_state(state_with_provider())
///     .when_action(BookingAction::AcquireSlotLock { correlation_id, slot, holder_id })
///     .then_state(move |state| {
///         assert!(state.locks.get(&slot).is_some());
///     })
///     .then_effects(|effects| {
///         assertions::assert_has_delay_effect(effects);
///     })
///     .run();
/// ```
pub struct ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
{
    reducer: R,
    environment: Option<E>,
    initial_state: Option<S>,
    action: Option<A>,
    state_assertions: Vec<StateAssertion<S>>,
    effect_assertions: Vec<EffectAssertion<A>>,
}

impl<R, S, A, E> ReducerTest<R, S, A, E>
where
    R: Reducer<State = S, Action = A, Environment = E>,
    S: Clone,
    A: Clone,
{
    /// Create a new reducer test with the given reducer
    #[must_use]
    pub const fn new(reducer: R) -> Self {
        Self {
            reducer,
            environment: None,
            initial_state: None,
            action: None,
            state_assertions: Vec::new(),
            effect_assertions: Vec::new(),
        }
    }

    /// Set the environment for the test
    #[must_use]
    pub fn with_env(mut self, env: E) -> Self {
        self.environment = Some(env);
        self
    }

    /// Set the initial state (Given)
    #[must_use]
    pub fn given_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Set the action to test (When)
    #[must_use]
    pub fn when_action(mut self, action: A) -> Self {
        self.action = Some(action);
        self
    }

    /// Add an assertion about the resulting state (Then)
    #[must_use]
    pub fn then_state<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&S) + 'static,
    {
        self.state_assertions.push(Box::new(assertion));
        self
    }

    /// Add an assertion about the resulting effects (Then)
    #[must_use]
    pub fn then_effects<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Effect<A>]) + 'static,
    {
        self.effect_assertions.push(Box::new(assertion));
        self
    }

    /// Run the test and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if initial state, action, or environment is not set,
    /// or if any assertions fail.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let mut state = self
            .initial_state
            .expect("Initial state must be set with given_state()");

        let action = self.action.expect("Action must be set with when_action()");

        let env = self
            .environment
            .expect("Environment must be set with with_env()");

        // Execute reducer
        let effects = self.reducer.reduce(&mut state, action, &env);

        // Run state assertions
        for assertion in self.state_assertions {
            assertion(&state);
        }

        // Run effect assertions
        for assertion in self.effect_assertions {
            assertion(&effects);
        }
    }
}

/// Helper assertions for effects
pub mod assertions {
    use slotbook_core::effect::Effect;

    /// Assert that there are no effects
    ///
    /// # Panics
    ///
    /// Panics if effects is not empty.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_no_effects<A: std::fmt::Debug>(effects: &[Effect<A>]) {
        assert!(
            effects.is_empty() || matches!(effects, [Effect::None]),
            "Expected no effects, but found {}: {:?}",
            effects.len(),
            effects
        );
    }

    /// Assert the number of effects
    ///
    /// # Panics
    ///
    /// Panics if the number of effects doesn't match expected.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_effects_count<A>(effects: &[Effect<A>], expected: usize) {
        assert_eq!(
            effects.len(),
            expected,
            "Expected {} effects, but found {}",
            expected,
            effects.len()
        );
    }

    /// Assert that effects contain at least one Future effect
    ///
    /// # Panics
    ///
    /// Panics if no Future effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_future_effect<A>(effects: &[Effect<A>]) {
        assert!(
            effects.iter().any(|e| matches!(e, Effect::Future(_))),
            "Expected at least one Future effect, but none found"
        );
    }

    /// Assert that effects contain at least one Delay effect
    ///
    /// Looks inside `Parallel` and `Sequential` groups.
    ///
    /// # Panics
    ///
    /// Panics if no Delay effect is found.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_delay_effect<A>(effects: &[Effect<A>]) {
        fn has_delay<A>(effect: &Effect<A>) -> bool {
            match effect {
                Effect::Delay { .. } => true,
                Effect::Parallel(inner) | Effect::Sequential(inner) => inner.iter().any(has_delay),
                Effect::None | Effect::Future(_) => false,
            }
        }

        assert!(
            effects.iter().any(has_delay),
            "Expected at least one Delay effect, but none found"
        );
    }
}

/// Run effects outside a store
pub mod effects {
    use slotbook_core::effect::Effect;
    use std::future::Future;
    use std::pin::Pin;

    /// Await every `Future` effect (recursing into `Parallel` and
    /// `Sequential`) and return the actions they produce, in order.
    ///
    /// Delays are timers, not results, so they are skipped.
    pub async fn resolve_actions<A: Send + 'static>(effects: impl IntoIterator<Item = Effect<A>>) -> Vec<A> {
        let mut actions = Vec::new();
        for effect in effects {
            resolve_one(effect, &mut actions).await;
        }
        actions
    }

    fn resolve_one<'a, A: Send + 'static>(
        effect: Effect<A>,
        out: &'a mut Vec<A>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match effect {
                Effect::None | Effect::Delay { .. } => {},
                Effect::Future(fut) => {
                    if let Some(action) = fut.await {
                        out.push(action);
                    }
                },
                Effect::Parallel(inner) | Effect::Sequential(inner) => {
                    for effect in inner {
                        resolve_one(effect, out).await;
                    }
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotbook_core::effect::Effect;
    use slotbook_core::reducer::Reducer;

    #[derive(Clone, Debug)]
    struct TestState {
        count: i32,
    }

    #[derive(Clone, Debug)]
    enum TestAction {
        Increment,
        Decrement,
    }

    struct TestReducer;

    struct TestEnv;

    impl Reducer for TestReducer {
        type State = TestState;
        type Action = TestAction;
        type Environment = TestEnv;

        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            _env: &Self::Environment,
        ) -> slotbook_core::SmallVec<[Effect<Self::Action>; 4]> {
            match action {
                TestAction::Increment => {
                    state.count += 1;
                    slotbook_core::smallvec![Effect::None]
                }
                TestAction::Decrement => {
                    state.count -= 1;
                    slotbook_core::smallvec![Effect::None]
                }
            }
        }
    }

    #[test]
    fn test_reducer_test_increment() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 0 })
            .when_action(TestAction::Increment)
            .then_state(|state| {
                assert_eq!(state.count, 1);
            })
            .then_effects(|effects| {
                assertions::assert_no_effects(effects);
            })
            .run();
    }

    #[test]
    fn test_reducer_test_decrement() {
        ReducerTest::new(TestReducer)
            .with_env(TestEnv)
            .given_state(TestState { count: 5 })
            .when_action(TestAction::Decrement)
            .then_state(|state| {
                assert_eq!(state.count, 4);
            })
            .run();
    }

    #[test]
    fn test_assertions_no_effects() {
        assertions::assert_no_effects::<TestAction>(&[Effect::None]);
        assertions::assert_no_effects::<TestAction>(&[]);
    }

    #[test]
    fn test_assert_has_delay_effect_looks_inside_groups() {
        let effects = vec![Effect::Parallel(vec![
            Effect::None,
            Effect::Delay {
                duration: std::time::Duration::from_secs(1),
                action: Box::new(TestAction::Increment),
            },
        ])];
        assertions::assert_has_delay_effect(&effects);
    }

    #[tokio::test]
    async fn test_resolve_actions_flattens_groups() {
        let effects = vec![
            Effect::Future(Box::pin(async { Some(TestAction::Increment) })),
            Effect::Parallel(vec![
                Effect::Future(Box::pin(async { Some(TestAction::Decrement) })),
                Effect::Future(Box::pin(async { None })),
            ]),
            Effect::Delay {
                duration: std::time::Duration::from_secs(60),
                action: Box::new(TestAction::Increment),
            },
        ];

        let actions = effects::resolve_actions(effects).await;
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], TestAction::Increment));
        assert!(matches!(actions[1], TestAction::Decrement));
    }

    #[test]
    fn test_assertions_effects_count() {
        assertions::assert_effects_count(&[Effect::<TestAction>::None], 1);
        assertions::assert_effects_count::<TestAction>(&[], 0);
    }
}
