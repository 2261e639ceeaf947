/// How many items each waiting requester receives, in request order.
///
/// With at least one item per participant (requesters plus this rank) every
/// requester gets `items / (requesters + 1)` and the remainder stays here.
/// Otherwise the first `items - 1` requesters get one item each, this rank
/// keeps one, and the rest get nothing.
pub fn plan_split(items: usize, requesters: usize) -> Vec<usize> {
    if items >= requesters + 1 {
        vec![items / (requesters + 1); requesters]
    } else {
        let givers = items.saturating_sub(1);
        (0..requesters).map(|i| usize::from(i < givers)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split_keeps_remainder() {
        assert_eq!(plan_split(10, 2), vec![3, 3]);
        assert_eq!(plan_split(3, 2), vec![1, 1]);
        assert_eq!(plan_split(9, 1), vec![4]);
    }

    #[test]
    fn scarce_items_go_one_each() {
        assert_eq!(plan_split(3, 4), vec![1, 1, 0, 0]);
        assert_eq!(plan_split(1, 2), vec![0, 0]);
    }

    #[test]
    fn never_gives_away_the_last_item() {
        for items in 1..20 {
            for requesters in 0..20 {
                let given: usize = plan_split(items, requesters).iter().sum();
                assert!(given < items, "items={items} requesters={requesters}");
            }
        }
    }

    #[test]
    fn no_requesters_no_plan() {
        assert!(plan_split(5, 0).is_empty());
    }
}
