use petek::HashMap;

#[test]
fn test_insert_and_get() {
    let map = HashMap::new();
    let guard = petek::pin();
    assert_eq!(map.insert("a", 1, &guard), None);
    assert_eq!(map.insert("b", 2, &guard), None);
    assert_eq!(map.get(&"a", &guard), Some(&1));
    assert_eq!(map.get(&"b", &guard), Some(&2));
    assert_eq!(map.get(&"c", &guard), None);
}

#[test]
fn test_insert_replace() {
    let map = HashMap::new();
    let guard = petek::pin();
    assert_eq!(map.insert(1, 10, &guard), None);
    assert_eq!(map.insert(1, 20, &guard), Some(&10));
    assert_eq!(map.insert(1, 30, &guard), Some(&20));
    assert_eq!(map.get(&1, &guard), Some(&30));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_insert_if_absent() {
    let map = HashMap::new();
    let guard = petek::pin();
    assert_eq!(map.insert_if_absent(1, 10, &guard), None);
    // the key is present, so the map keeps the old value
    assert_eq!(map.insert_if_absent(1, 20, &guard), Some(&10));
    assert_eq!(map.get(&1, &guard), Some(&10));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_remove() {
    let map = HashMap::new();
    let guard = petek::pin();
    map.insert(1, 100, &guard);
    map.insert(2, 200, &guard);

    assert_eq!(map.remove(&1, &guard), Some(&100));
    assert_eq!(map.get(&1, &guard), None);
    assert_eq!(map.remove(&1, &guard), None);
    assert_eq!(map.get(&2, &guard), Some(&200));
}

#[test]
fn test_contains_key() {
    let map = HashMap::new();
    let guard = petek::pin();
    map.insert(42, "hello", &guard);
    assert!(map.contains_key(&42, &guard));
    assert!(!map.contains_key(&99, &guard));
}

#[test]
fn test_get_key_value() {
    let map = HashMap::new();
    let guard = petek::pin();
    map.insert(7, "seven", &guard);
    assert_eq!(map.get_key_value(&7, &guard), Some((&7, &"seven")));
    assert_eq!(map.get_key_value(&8, &guard), None);
}

#[test]
fn test_len_and_is_empty() {
    let map = HashMap::new();
    let guard = petek::pin();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);

    map.insert(1, 1, &guard);
    map.insert(2, 2, &guard);
    assert!(!map.is_empty());
    assert_eq!(map.len(), 2);

    map.remove(&1, &guard);
    assert_eq!(map.len(), 1);
}

#[test]
fn test_borrowed_key_lookup() {
    let map = HashMap::new();
    let guard = petek::pin();
    map.insert(String::from("alpha"), 1, &guard);
    assert_eq!(map.get("alpha", &guard), Some(&1));
    assert!(map.contains_key("alpha", &guard));
    assert_eq!(map.remove("alpha", &guard), Some(&1));
    assert_eq!(map.get("alpha", &guard), None);
}

#[test]
fn test_with_capacity_zero_is_an_error() {
    assert!(HashMap::<usize, usize>::with_capacity(0).is_err());
}

#[test]
fn test_with_capacity_error_message() {
    let err = HashMap::<usize, usize>::with_capacity(0).unwrap_err();
    assert_eq!(err.to_string(), "map capacity must be greater than zero");
}

#[test]
fn test_with_capacity_holds_requested_elements() {
    let map = HashMap::with_capacity(100).unwrap();
    let guard = petek::pin();
    for i in 0..100 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.len(), 100);
    for i in 0..100 {
        assert_eq!(map.get(&i, &guard), Some(&i));
    }
}

#[test]
fn test_iter_yields_every_entry_once() {
    let map = HashMap::new();
    let guard = petek::pin();
    for i in 0..64usize {
        map.insert(i, i * 2, &guard);
    }

    let mut seen: Vec<usize> = map.iter(&guard).map(|(&k, &v)| {
        assert_eq!(v, k * 2);
        k
    }).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..64).collect::<Vec<_>>());
}

#[test]
fn test_keys_and_values() {
    let map = HashMap::new();
    let guard = petek::pin();
    for i in 0..16usize {
        map.insert(i, i + 100, &guard);
    }

    let mut keys: Vec<usize> = map.keys(&guard).copied().collect();
    keys.sort_unstable();
    assert_eq!(keys, (0..16).collect::<Vec<_>>());

    let mut values: Vec<usize> = map.values(&guard).copied().collect();
    values.sort_unstable();
    assert_eq!(values, (100..116).collect::<Vec<_>>());
}

#[test]
fn test_iter_on_empty_map() {
    let map: HashMap<usize, usize> = HashMap::new();
    let guard = petek::pin();
    assert_eq!(map.iter(&guard).count(), 0);
    assert_eq!(map.keys(&guard).count(), 0);
    assert_eq!(map.values(&guard).count(), 0);
}

#[test]
fn test_debug_format() {
    let map = HashMap::new();
    let guard = petek::pin();
    map.insert(1, "one", &guard);
    let rendered = format!("{:?}", map);
    assert_eq!(rendered, r#"{1: "one"}"#);
}

#[test]
fn test_eq() {
    let a = HashMap::new();
    let b = HashMap::new();
    let guard = petek::pin();
    a.insert(1, 10, &guard);
    a.insert(2, 20, &guard);
    b.insert(2, 20, &guard);
    b.insert(1, 10, &guard);
    assert_eq!(a, b);

    b.insert(3, 30, &guard);
    assert_ne!(a, b);
}

#[test]
fn test_extend() {
    let map = HashMap::new();
    {
        let mut r = &map;
        r.extend((0..8usize).map(|i| (i, i)));
    }
    let guard = petek::pin();
    assert_eq!(map.len(), 8);
    assert_eq!(map.get(&3, &guard), Some(&3));
}

#[test]
fn test_from_iterator() {
    let map: HashMap<usize, usize> = (0..32).map(|i| (i, i * i)).collect();
    let guard = petek::pin();
    assert_eq!(map.len(), 32);
    assert_eq!(map.get(&5, &guard), Some(&25));
}

#[test]
fn test_clone() {
    let map = HashMap::new();
    let guard = petek::pin();
    for i in 0..20usize {
        map.insert(i, i.to_string(), &guard);
    }

    let copy = map.clone();
    assert_eq!(copy.len(), 20);
    for i in 0..20usize {
        assert_eq!(copy.get(&i, &guard).map(String::as_str), Some(i.to_string().as_str()));
    }

    // the clone is independent
    copy.insert(99, String::from("ninety-nine"), &guard);
    assert_eq!(map.get(&99, &guard), None);
}

#[test]
fn test_default() {
    let map: HashMap<usize, usize> = HashMap::default();
    assert!(map.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_random_ops_match_std_hashmap() {
    use rand::Rng;

    let map = HashMap::new();
    let mut oracle = std::collections::HashMap::new();
    let mut rng = rand::thread_rng();
    let guard = petek::pin();

    for _ in 0..10_000 {
        let key: usize = rng.gen_range(0..500);
        if rng.gen_bool(0.7) {
            let value: usize = rng.gen();
            assert_eq!(map.insert(key, value, &guard), oracle.insert(key, value).as_ref());
        } else {
            assert_eq!(map.remove(&key, &guard), oracle.remove(&key).as_ref());
        }
    }

    assert_eq!(map.len(), oracle.len());
    for (k, v) in &oracle {
        assert_eq!(map.get(k, &guard), Some(v));
    }
}
