//! Host-side contract tests for the C surface.

use std::ffi::CString;
use std::os::raw::{c_float, c_int};
use std::ptr;

use mycoswarm_ffi::*;

fn default_config(seed: u32) -> MsConfig {
    // Start from the engine defaults by reading them back from a context.
    unsafe {
        let handle = ms_create(ptr::null());
        assert!(!handle.is_null());
        let mut params = std::mem::zeroed::<MsParams>();
        ms_get_params(handle, &mut params);
        ms_destroy(handle);
        MsConfig { params, seed }
    }
}

fn small_config(seed: u32) -> MsConfig {
    let mut cfg = default_config(seed);
    cfg.params.width = 24;
    cfg.params.height = 24;
    cfg.params.agent_count = 16;
    cfg
}

#[test]
fn every_entry_point_tolerates_null_handles() {
    unsafe {
        let null = ptr::null_mut();
        ms_destroy(null);
        assert!(ms_clone(null).is_null());
        ms_reset(null, 1);
        assert_eq!(ms_step(null, 5), 0);
        assert_eq!(ms_run(null, 5), 0);
        ms_pause(null);
        ms_resume(null);
        assert_eq!(ms_get_step_index(null), 0);

        ms_set_params(null, ptr::null());
        ms_get_params(null, ptr::null_mut());
        ms_set_species_profiles(null, ptr::null());
        ms_get_species_profiles(null, ptr::null_mut());
        ms_set_species_fracs(null, ptr::null());
        ms_get_species_fracs(null, ptr::null_mut());

        let mut w = -1;
        let mut h = -1;
        ms_get_field_info(null, 0, &mut w, &mut h);
        assert_eq!((w, h), (0, 0));
        assert_eq!(ms_copy_field_out(null, 0, ptr::null_mut(), 0), 0);
        assert_eq!(ms_copy_field_in(null, 0, ptr::null(), 0), 0);
        ms_clear_field(null, 0, 1.0);
        assert_eq!(ms_load_field_csv(null, 0, ptr::null()), 0);
        assert_eq!(ms_save_field_csv(null, 0, ptr::null()), 0);

        assert_eq!(ms_get_agent_count(null), 0);
        assert_eq!(ms_get_agents(null, ptr::null_mut(), 8), 0);
        ms_set_agents(null, ptr::null(), 0);
        ms_kill_agent(null, 0);
        ms_spawn_agent(null, ptr::null());

        ms_get_dna_sizes(null, ptr::null_mut(), ptr::null_mut());
        ms_get_dna_capacity(null, ptr::null_mut(), ptr::null_mut());
        ms_set_dna_capacity(null, 8, 8);
        ms_clear_dna_pools(null);
        assert_eq!(ms_export_dna_csv(null, ptr::null()), 0);
        assert_eq!(ms_import_dna_csv(null, ptr::null()), 0);

        ms_get_system_metrics(null, ptr::null_mut());
        ms_get_energy_stats(null, ptr::null_mut(), ptr::null_mut(), ptr::null_mut());
        ms_get_energy_by_species(null, ptr::null_mut());
        ms_get_entropy_metrics(null, ptr::null_mut());
        ms_get_mycel_stats(null, ptr::null_mut());

        ms_ocl_enable(null, 1);
        ms_ocl_select_device(null, 0, 0);
        ms_ocl_set_no_copyback(null, 1);
        assert_eq!(ms_is_gpu_active(null), 0);
    }
}

#[test]
fn lifecycle_and_stepping() {
    unsafe {
        let cfg = small_config(7);
        let handle = ms_create(&cfg);
        assert!(!handle.is_null());

        assert_eq!(ms_get_agent_count(handle), 16);
        assert_eq!(ms_step(handle, 10), 10);
        assert_eq!(ms_get_step_index(handle), 10);

        ms_pause(handle);
        assert_eq!(ms_step(handle, 5), 0);
        assert_eq!(ms_get_step_index(handle), 10);
        ms_resume(handle);
        assert_eq!(ms_run(handle, 5), 5);
        assert_eq!(ms_get_step_index(handle), 15);

        ms_reset(handle, 99);
        assert_eq!(ms_get_step_index(handle), 0);
        ms_destroy(handle);
    }
}

#[test]
fn invalid_config_yields_null_handle() {
    unsafe {
        let mut cfg = small_config(1);
        cfg.params.width = 0;
        assert!(ms_create(&cfg).is_null());

        let mut cfg = small_config(1);
        cfg.params.pheromone_diffusion = 7.0;
        assert!(ms_create(&cfg).is_null());
    }
}

#[test]
fn set_params_silently_rejects_invalid_values() {
    unsafe {
        let handle = ms_create(&small_config(3));
        let mut before = std::mem::zeroed::<MsParams>();
        ms_get_params(handle, &mut before);

        let mut bad = before;
        bad.width = -4;
        ms_set_params(handle, &bad);

        let mut after = std::mem::zeroed::<MsParams>();
        ms_get_params(handle, &mut after);
        assert_eq!(after.width, before.width);
        ms_destroy(handle);
    }
}

#[test]
fn field_copy_contracts() {
    unsafe {
        let handle = ms_create(&small_config(5));
        let mut w = 0;
        let mut h = 0;
        ms_get_field_info(handle, 1, &mut w, &mut h);
        assert_eq!((w, h), (24, 24));

        // Unknown field kind.
        ms_get_field_info(handle, 9, &mut w, &mut h);
        assert_eq!((w, h), (0, 0));

        let count = 24 * 24;
        let mut buf = vec![0.0f32; count];
        // Undersized destination is rejected.
        assert_eq!(ms_copy_field_out(handle, 1, buf.as_mut_ptr(), count as c_int - 1), 0);
        assert_eq!(
            ms_copy_field_out(handle, 1, buf.as_mut_ptr(), count as c_int),
            count as c_int
        );

        let values: Vec<c_float> = (0..count).map(|i| (i % 5) as f32 * 0.2).collect();
        assert_eq!(
            ms_copy_field_in(handle, 3, values.as_ptr(), count as c_int),
            count as c_int
        );
        let mut readback = vec![0.0f32; count];
        assert_eq!(
            ms_copy_field_out(handle, 3, readback.as_mut_ptr(), count as c_int),
            count as c_int
        );
        assert_eq!(readback, values);

        ms_clear_field(handle, 3, 0.75);
        ms_copy_field_out(handle, 3, readback.as_mut_ptr(), count as c_int);
        assert!(readback.iter().all(|v| *v == 0.75));
        ms_destroy(handle);
    }
}

#[test]
fn field_csv_round_trip_via_abi() {
    unsafe {
        let dir = std::env::temp_dir().join(format!("mycoswarm_abi_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("field.csv");
        let c_path = CString::new(path.to_str().unwrap()).unwrap();

        let handle = ms_create(&small_config(11));
        ms_clear_field(handle, 0, 0.125);
        assert_eq!(ms_save_field_csv(handle, 0, c_path.as_ptr()), 1);
        ms_clear_field(handle, 0, 0.0);
        assert_eq!(ms_load_field_csv(handle, 0, c_path.as_ptr()), 1);

        let count = 24 * 24;
        let mut buf = vec![0.0f32; count];
        ms_copy_field_out(handle, 0, buf.as_mut_ptr(), count as c_int);
        assert!(buf.iter().all(|v| (*v - 0.125).abs() < 1e-6));

        ms_destroy(handle);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

#[test]
fn agents_round_trip_and_kill_respawns() {
    unsafe {
        let handle = ms_create(&small_config(13));

        let agents = [MsAgent {
            x: 5.0,
            y: 6.0,
            heading: 1.0,
            energy: 0.9,
            species: 2,
            sense_gain: 9.0, // clamps to 3.0
            pheromone_gain: 1.0,
            exploration_bias: 0.5,
        }];
        ms_set_agents(handle, agents.as_ptr(), 1);
        assert_eq!(ms_get_agent_count(handle), 1);

        let mut out = [std::mem::zeroed::<MsAgent>(); 4];
        assert_eq!(ms_get_agents(handle, out.as_mut_ptr(), 4), 1);
        assert_eq!(out[0].species, 2);
        assert!((out[0].sense_gain - 3.0).abs() < 1e-6);

        ms_kill_agent(handle, 0);
        assert_eq!(ms_get_agents(handle, out.as_mut_ptr(), 4), 1);
        assert_eq!(out[0].energy, 0.0);
        ms_step(handle, 1);
        assert_eq!(ms_get_agents(handle, out.as_mut_ptr(), 4), 1);
        assert!((0.2..0.5).contains(&out[0].energy), "slot respawned");

        ms_spawn_agent(
            handle,
            &MsAgent {
                x: 1.0,
                y: 1.0,
                heading: 0.0,
                energy: 0.4,
                species: 0,
                sense_gain: 1.0,
                pheromone_gain: 1.0,
                exploration_bias: 0.5,
            },
        );
        assert_eq!(ms_get_agent_count(handle), 2);
        ms_destroy(handle);
    }
}

#[test]
fn clone_emits_identical_metrics() {
    unsafe {
        let mut cfg = small_config(17);
        cfg.params.evo_enable = 1;
        let original = ms_create(&cfg);
        ms_step(original, 10);
        let twin = ms_clone(original);
        assert!(!twin.is_null());

        for _ in 0..25 {
            ms_step(original, 1);
            ms_step(twin, 1);
            let mut a = std::mem::zeroed::<MsMetrics>();
            let mut b = std::mem::zeroed::<MsMetrics>();
            ms_get_system_metrics(original, &mut a);
            ms_get_system_metrics(twin, &mut b);
            assert_eq!(a.step_index, b.step_index);
            assert_eq!(a.avg_energy.to_bits(), b.avg_energy.to_bits());
            assert_eq!(a.dna_species_sizes, b.dna_species_sizes);
            assert_eq!(a.dna_global_size, b.dna_global_size);
        }

        let count = 24 * 24;
        let mut fa = vec![0.0f32; count];
        let mut fb = vec![0.0f32; count];
        for kind in 0..5 {
            ms_copy_field_out(original, kind, fa.as_mut_ptr(), count as c_int);
            ms_copy_field_out(twin, kind, fb.as_mut_ptr(), count as c_int);
            for (a, b) in fa.iter().zip(fb.iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }

        ms_destroy(original);
        ms_destroy(twin);
    }
}

#[test]
fn dna_surface_and_version() {
    unsafe {
        let mut cfg = small_config(19);
        cfg.params.evo_enable = 1;
        cfg.params.evo_min_energy_to_store = 0.1;
        let handle = ms_create(&cfg);
        ms_step(handle, 40);

        let mut sizes = [0 as c_int; 4];
        let mut global = 0 as c_int;
        ms_get_dna_sizes(handle, sizes.as_mut_ptr(), &mut global);
        assert!(sizes.iter().any(|s| *s > 0), "no genomes stored");

        ms_set_dna_capacity(handle, 2, 2);
        ms_get_dna_sizes(handle, sizes.as_mut_ptr(), &mut global);
        assert!(sizes.iter().all(|s| *s <= 2));
        assert!(global <= 2);

        let mut species_cap = 0;
        let mut global_cap = 0;
        ms_get_dna_capacity(handle, &mut species_cap, &mut global_cap);
        assert_eq!((species_cap, global_cap), (2, 2));

        ms_clear_dna_pools(handle);
        ms_get_dna_sizes(handle, sizes.as_mut_ptr(), &mut global);
        assert_eq!(sizes, [0; 4]);
        assert_eq!(global, 0);
        ms_destroy(handle);

        let (mut major, mut minor, mut patch) = (0, 0, 0);
        ms_get_api_version(&mut major, &mut minor, &mut patch);
        assert_eq!((major, minor, patch), (1, 0, 0));
    }
}

#[test]
fn profiles_and_fracs_round_trip_without_reinit() {
    unsafe {
        let handle = ms_create(&small_config(23));
        ms_step(handle, 3);

        let mut profiles = [std::mem::zeroed::<MsSpeciesProfile>(); 4];
        ms_get_species_profiles(handle, profiles.as_mut_ptr());
        assert!((profiles[2].counter_deposit_mul - 0.5).abs() < 1e-6);

        profiles[0].novelty_weight = 0.33;
        ms_set_species_profiles(handle, profiles.as_ptr());
        let mut check = [std::mem::zeroed::<MsSpeciesProfile>(); 4];
        ms_get_species_profiles(handle, check.as_mut_ptr());
        assert!((check[0].novelty_weight - 0.33).abs() < 1e-6);

        let fracs = [0.25f32, 0.25, 0.25, 0.25];
        ms_set_species_fracs(handle, fracs.as_ptr());
        let mut out = [0.0f32; 4];
        ms_get_species_fracs(handle, out.as_mut_ptr());
        assert_eq!(out, fracs);

        // No re-initialisation: the tick counter is untouched.
        assert_eq!(ms_get_step_index(handle), 3);
        ms_destroy(handle);
    }
}

#[test]
fn no_copyback_refused_while_agents_exist() {
    unsafe {
        let handle = ms_create(&small_config(29));
        ms_ocl_set_no_copyback(handle, 1);
        // Still readable and consistent: host fields remain authoritative.
        let count = 24 * 24;
        let mut buf = vec![0.0f32; count];
        assert_eq!(
            ms_copy_field_out(handle, 0, buf.as_mut_ptr(), count as c_int),
            count as c_int
        );
        ms_destroy(handle);
    }
}
