//! Fuel for the machine

/// An instruction budget. The VM consumes one unit per executed instruction
/// and stops with [`super::VmError::OutOfFuel`] once it runs dry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fuel {
    fuel: i32,
}

impl Fuel {
    pub fn with(fuel: i32) -> Self {
        Self { fuel }
    }

    /// Refills fuel up to a given maximum.
    ///
    /// Intended to be called between runs by a host that re-uses one budget
    /// across many executions (a REPL line, for instance).
    pub fn refill(&mut self, fuel: i32, max_fuel: i32) {
        self.fuel = self.fuel.saturating_add(fuel).min(max_fuel);
    }

    /// Subtract from the current remaining fuel.
    pub fn consume(&mut self, fuel: i32) {
        self.fuel = self.fuel.saturating_sub(fuel);
    }

    pub fn remaining(&self) -> i32 {
        self.fuel
    }

    /// Returns true if we have positive fuel remaining.
    pub fn should_continue(&self) -> bool {
        self.fuel > 0
    }
}

#[cfg(test)]
mod tests {
    use super::Fuel;
    use assert2::check;

    #[test]
    fn consume_and_refill() {
        let mut fuel = Fuel::with(2);
        check!(fuel.should_continue());
        fuel.consume(2);
        check!(!fuel.should_continue());
        fuel.refill(10, 5);
        check!(fuel.remaining() == 5);
        check!(fuel.should_continue());

        fuel.consume(7);
        check!(fuel.remaining() == -2);
        fuel.refill(1, 5);
        check!(!fuel.should_continue());
    }

    #[test]
    fn saturates() {
        let mut fuel = Fuel::with(i32::MIN + 1);
        fuel.consume(5);
        check!(fuel.remaining() == i32::MIN);
    }
}
