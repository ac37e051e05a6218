//! Pager rebinding for cached plans.

use crate::plan::Plan;
use query_core::{Pager, PagerBound};

impl PagerBound for Plan {
    fn bound_pager(&self) -> Option<&Pager> {
        self.pager.as_ref()
    }

    /// A copy of the plan that reads and writes `pager`; commands take their
    /// segment from it at execution time.
    fn rebind_pager(&self, pager: &Pager) -> Self {
        Plan {
            pager: Some(pager.clone()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{CallShape, PlanEntry};
    use query_core::Value;

    #[test]
    fn test_rebind_swaps_the_live_pager() {
        let first = Pager::new(0, 10);
        let plan = Plan {
            entry: PlanEntry::Constant(Value::Int64(1)),
            shape: CallShape::StorePager,
            entity_types: vec!["Person".into()],
            pager: Some(first.clone()),
        };

        let second = Pager::new(10, 10);
        let rebound = plan.rebind_pager(&second);
        assert!(rebound.bound_pager().map_or(false, |p| p.ptr_eq(&second)));
        assert!(plan.bound_pager().map_or(false, |p| p.ptr_eq(&first)));
        assert_eq!(rebound.shape, plan.shape);
    }
}
