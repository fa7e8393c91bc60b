// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

mod common;

use std::sync::{ Arc, Barrier };
use std::time::{ Duration, Instant };
use depthlut_core::*;
use depthlut_core::lookup_table::{ GenerationStyle, slot };
use depthlut_core::partial_update::UpdateDecision;
use common::*;

#[test]
fn unchanged_lookup_builds_once() {
    let s = service(&[]);
    let a = s.get_or_build("Acme", "X1", 64, 48, &small_vector(), None).unwrap();
    let b = s.get_or_build("Acme", "X1", 64, 48, &small_vector(), None).unwrap();
    assert_eq!(s.cache().build_count(), 1);
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn simultaneous_misses_build_once() {
    let s = service(&[]);
    let barrier = Barrier::new(2);
    let (a, b) = std::thread::scope(|scope| {
        let run = || {
            barrier.wait();
            s.get_or_build("Acme", "X1", 64, 48, &small_vector(), None).unwrap()
        };
        let a = scope.spawn(run);
        let b = scope.spawn(run);
        (a.join().unwrap(), b.join().unwrap())
    });
    assert_eq!(s.cache().build_count(), 1);
    assert!(Arc::ptr_eq(&a, &b));
}

#[test]
fn transform_only_change_is_patched() {
    let s = service(&[]);
    let before = s.get_or_build("Acme", "X1", 64, 48, &small_vector(), None).unwrap();
    let snapshot: Vec<u32> = before.coefficients().iter().map(|x| x.to_bits()).collect();

    let mut moved = small_vector();
    moved[15] = 100.0; // tx
    moved[19] = -40.0; // ty
    let l = s.lookup("Acme", "X1", 64, 48, &moved, None, &BuildControl::default()).unwrap();

    assert_eq!(l.outcome, CacheOutcome::Patched(UpdateDecision::Patch { transform: true, bounding_box: false, z_range: false }));
    assert_eq!(s.cache().build_count(), 1);
    assert_eq!(l.table.transform[(0, 3)], 100.0);
    assert_eq!(l.table.transform[(1, 3)], -40.0);
    let after: Vec<u32> = l.table.coefficients().iter().map(|x| x.to_bits()).collect();
    assert_eq!(after, snapshot);

    // Points move with the transform, rays do not
    let p0 = before.world_point(32, 24, 1000.0).unwrap();
    let p1 = l.table.world_point(32, 24, 1000.0).unwrap();
    assert!((p1[0] - p0[0] - 100.0).abs() < 1e-9);
    assert!((p1[1] - p0[1] + 40.0).abs() < 1e-9);
}

#[test]
fn invalidation_is_scoped_to_one_camera() {
    let s = service(&[]);
    for (model, w, h) in [("X1", 64, 48), ("X1", 32, 24), ("X2", 64, 48), ("X2", 32, 24)] {
        s.get_or_build("Acme", model, w, h, &small_vector(), None).unwrap();
    }
    assert_eq!(s.invalidate("Acme", "X1"), 2);

    let keys = s.cache().keys();
    assert_eq!(keys, vec![CacheKey::new("Acme", "X2", 32, 24), CacheKey::new("Acme", "X2", 64, 48)]);
    s.clear();
    assert!(s.cache().is_empty());
}

#[test]
fn pause_then_stop_does_not_hang() {
    let s = service(&["X1", "X2", "X3", "X4"]);
    s.start().unwrap();
    let time = Instant::now();
    s.pause();
    s.stop().unwrap();
    assert!(!s.is_running());
    assert!(time.elapsed() < s.config().stop_timeout());
}

#[test]
fn camera_change_rebuilds_standard_sizes() {
    let s = service(&["X1"]);
    let events = s.subscribe();
    s.start().unwrap();
    let wait = Duration::from_secs(30);
    assert!(matches!(events.recv_timeout(wait).unwrap(), SchedulerEvent::TableBuilt { .. }));
    assert_eq!(events.recv_timeout(wait).unwrap(), SchedulerEvent::BacklogDrained);

    s.camera_changed("Acme", "X1");
    assert_eq!(events.recv_timeout(wait).unwrap(), SchedulerEvent::TableBuilt { make: "Acme".into(), model: "X1".into(), width: 64, height: 48 });
    assert_eq!(events.recv_timeout(wait).unwrap(), SchedulerEvent::BacklogDrained);
    assert_eq!(s.cache().build_count(), 2);
    s.stop().unwrap();
}

#[test]
fn rotation_follows_the_remount_date() {
    let s = service(&[]);
    let quirk = tall_quirk();
    let native = s.build_table(quirk.native.w, quirk.native.h, &small_vector(), "Acme", "Plain", None, &BuildControl::default()).unwrap();
    let cropped = native.crop(0, 4, 64, 48).unwrap();

    let build = |d| s.build_table(64, 48, &small_vector(), "Acme", "Tall", d, &BuildControl::default()).unwrap();

    let before = build(date(2023, 6, 14));
    assert!(before.coefficients_bitwise_eq(&cropped.rotate_180()));
    assert_eq!(before.style, GenerationStyle::NativeCrop { native: quirk.native, rotated: true });

    let on = build(date(2023, 6, 15));
    assert!(on.coefficients_bitwise_eq(&cropped));

    let after = build(date(2023, 6, 16));
    assert!(after.coefficients_bitwise_eq(&cropped));
    assert_eq!(after.style, GenerationStyle::NativeCrop { native: quirk.native, rotated: false });

    // Unknown capture date is treated as before the remount
    assert!(build(None).coefficients_bitwise_eq(&before));
}

#[test]
fn principal_point_looks_down_the_optical_axis() {
    let s = service(&[]);
    let v = pinhole(500.0, 640, 480);
    let t = s.get_or_build("Acme", "Wide", 640, 480, &v, None).unwrap();

    let px = t.pixel(320, 240).unwrap();
    assert!(px[slot::RESIDUAL] < 1e-3);
    assert_eq!(px[slot::X_OFFSET], 0.0);
    assert_eq!(px[slot::Y_OFFSET], 0.0);
    assert!(px[slot::X_SLOPE].abs() < 1e-4);
    assert!(px[slot::Y_SLOPE].abs() < 1e-4);
    assert!((px[slot::RAY_NORM] - 1.0).abs() < 1e-6);
    assert_eq!(t.unresolved_count(), 0);

    let p = t.world_point(320, 240, 1000.0).unwrap();
    assert!(p[0].abs() < 0.1 && p[1].abs() < 0.1);
    assert!((p[2] + 250.0).abs() < 1e-9);
}

#[test]
fn saved_table_serves_the_cache() {
    let s = service(&[]);
    let built = s.build_table(64, 48, &small_vector(), "Acme", "X1", None, &BuildControl::default()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x1.dlut");
    table_file::save(&built, &path).unwrap();
    s.insert("Acme", "X1", 64, 48, table_file::load(&path).unwrap());

    let l = s.lookup("Acme", "X1", 64, 48, &small_vector(), None, &BuildControl::default()).unwrap();
    assert_eq!(l.outcome, CacheOutcome::Hit);
    assert_eq!(*l.table, built);
    assert_eq!(s.cache().build_count(), 0);
}
