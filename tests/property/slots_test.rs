// tests/property/slots_test.rs

use haproxy_cloud_discovery::config::{GrowthType, ServerSlotsConfig};
use haproxy_cloud_discovery::core::haproxy::slots::SlotAllocator;
use proptest::prelude::*;

fn allocator(base: usize, growth_factor: f64, growth_type: GrowthType) -> SlotAllocator {
    SlotAllocator::new(&ServerSlotsConfig {
        base,
        growth_factor,
        growth_type,
    })
}

proptest! {
    /// The slot count never drops below the base or the active count.
    #[test]
    fn slots_cover_active_count_linear(
        base in 10usize..40,
        factor in 0.1f64..3.0,
        count in 0usize..500,
    ) {
        let alloc = allocator(base, factor, GrowthType::Linear);
        let slots = alloc.calculate_slots(count);
        prop_assert!(slots >= base);
        prop_assert!(slots >= count);
    }

    #[test]
    fn slots_cover_active_count_exponential(
        base in 10usize..40,
        factor in 1.1f64..3.0,
        count in 0usize..500,
    ) {
        let alloc = allocator(base, factor, GrowthType::Exponential);
        let slots = alloc.calculate_slots(count);
        prop_assert!(slots >= base);
        prop_assert!(slots >= count);
    }

    /// Counts at or below the base always return exactly the base.
    #[test]
    fn base_floor_is_exact(
        base in 10usize..40,
        factor in 0.1f64..3.0,
        count in 0usize..40,
    ) {
        prop_assume!(count <= base);
        let alloc = allocator(base, factor, GrowthType::Linear);
        prop_assert_eq!(alloc.calculate_slots(count), base);
    }

    /// More active instances never need fewer slots.
    #[test]
    fn monotonic_in_count_linear(
        base in 10usize..40,
        factor in 0.1f64..3.0,
        count in 0usize..499,
    ) {
        let alloc = allocator(base, factor, GrowthType::Linear);
        prop_assert!(alloc.calculate_slots(count + 1) >= alloc.calculate_slots(count));
    }

    #[test]
    fn monotonic_in_count_exponential(
        base in 10usize..40,
        factor in 1.1f64..3.0,
        count in 0usize..499,
    ) {
        let alloc = allocator(base, factor, GrowthType::Exponential);
        prop_assert!(alloc.calculate_slots(count + 1) >= alloc.calculate_slots(count));
    }

    /// Generated names are always srv1..srvN in order.
    #[test]
    fn server_names_are_sequential(count in 0usize..200) {
        let names = SlotAllocator::generate_server_names(count);
        prop_assert_eq!(names.len(), count);
        for (i, name) in names.iter().enumerate() {
            prop_assert_eq!(name, &format!("srv{}", i + 1));
        }
    }
}
