use ark_bls12_381::Fr;
use ark_poly::{EvaluationDomain, GeneralEvaluationDomain};

/// Returns the multiplicative subgroup of exactly `degree` points, or `None`
/// when `degree` is not a power of two the field can host.
pub fn evaluation_domain(degree: usize) -> Option<GeneralEvaluationDomain<Fr>> {
    if !degree.is_power_of_two() {
        return None;
    }
    GeneralEvaluationDomain::<Fr>::new(degree).filter(|domain| domain.size() == degree)
}

#[test]
fn test_evaluation_domain_sizes() {
    let domain = evaluation_domain(8).unwrap();
    assert_eq!(domain.size(), 8);

    // Row i maps to the i-th power of the group generator
    let points: Vec<Fr> = domain.elements().collect();
    assert_eq!(points[3], domain.group_gen() * domain.group_gen() * domain.group_gen());

    assert!(evaluation_domain(6).is_none());
    assert!(evaluation_domain(0).is_none());
}
