mod common;

use std::sync::Arc;
use tbdr::{
    device::{GLOBAL_FREE_LIST_INITIAL_SIZE, SECONDARY_DEVICE_FREE_LIST_INITIAL_SIZE},
    free_list::size_alignment,
    hw::PM_PAGE_SIZE,
    DeviceInfo, Error, FreeListCreateInfo, HostMemory,
};

const KB: u64 = 1024;

#[test]
fn global_list_size_depends_on_open_devices() {
    let first = common::device();
    assert_eq!(first.global_free_list().size(), GLOBAL_FREE_LIST_INITIAL_SIZE);

    let second = tbdr::Device::new(tbdr::DeviceCreateInfo {
        info: DeviceInfo::default(),
        diagnostics: tbdr::Diagnostics::empty(),
        memory: Arc::new(HostMemory::new()),
        programs: Arc::new(common::Programs),
        active_devices: 1,
    })
    .unwrap();
    assert_eq!(second.global_free_list().size(), SECONDARY_DEVICE_FREE_LIST_INITIAL_SIZE);
}

#[test]
fn local_list_borrows_from_global() {
    let device = common::device();
    let global = device.global_free_list().clone();
    let local = device
        .create_free_list(FreeListCreateInfo {
            initial_size: 64 * KB,
            max_size: 128 * KB,
            grow_size: 64 * KB,
            grow_threshold: 0,
            parent: Some(global.clone()),
        })
        .unwrap();

    local.acquire(192 * KB).unwrap();
    assert_eq!(local.size(), 128 * KB);
    assert_eq!(local.borrowed(), 64 * KB);
    assert_eq!(local.used(), 192 * KB);

    local.release(192 * KB);
    assert_eq!(local.borrowed(), 0);
    assert_eq!(local.used(), 0);

    // everything was handed back: the global list can lend its whole size again
    let other = device
        .create_free_list(FreeListCreateInfo {
            initial_size: 0,
            max_size: PM_PAGE_SIZE,
            grow_size: 0,
            grow_threshold: 0,
            parent: Some(global.clone()),
        })
        .unwrap();
    other.acquire(global.size()).unwrap();
    assert_eq!(global.size(), GLOBAL_FREE_LIST_INITIAL_SIZE);
}

#[test]
fn root_list_reports_exhaustion() {
    let device = common::device();
    let list = device
        .create_free_list(FreeListCreateInfo {
            initial_size: 64 * KB,
            max_size: 128 * KB,
            grow_size: 64 * KB,
            grow_threshold: 0,
            parent: None,
        })
        .unwrap();
    assert_eq!(list.acquire(256 * KB), Err(Error::OutOfDeviceMemory));
    assert_eq!(list.size(), 128 * KB);
    assert_eq!(list.grow(), Err(Error::OutOfDeviceMemory));
}

#[test]
fn render_targets_draw_from_the_global_list() {
    let device = common::device();
    let pass = common::color_pass(&device);
    let fb = common::framebuffer(&device, &pass, 256, 256, 1);
    let rt = fb.render_target(&device, 1).unwrap();
    let parent = rt.local_free_list().parent().unwrap();
    assert!(Arc::ptr_eq(parent, device.global_free_list()));
    assert!(Arc::ptr_eq(rt.global_free_list(), device.global_free_list()));
    // the same dataset is handed out for the same sample count
    assert!(Arc::ptr_eq(&rt, &fb.render_target(&device, 1).unwrap()));
}

#[test]
fn empty_list_starts_with_one_page() {
    let device = common::device();
    let list = device
        .create_free_list(FreeListCreateInfo {
            initial_size: 0,
            max_size: 16 * 1024 * KB,
            grow_size: 0,
            grow_threshold: 0,
            parent: None,
        })
        .unwrap();
    assert_eq!(list.initial_size(), PM_PAGE_SIZE);
    assert_eq!(list.size(), PM_PAGE_SIZE);
}

#[test]
fn repeated_growth_stays_within_bounds() {
    let device = common::device();
    let alignment = size_alignment(device.info());
    let configs = [
        // (initial, max, grow)
        (0, 4 * alignment, alignment),
        (alignment, 5 * alignment, 2 * alignment),
        (alignment, 7 * alignment, 3 * PM_PAGE_SIZE),
        (2 * alignment, 300 * KB, 5 * PM_PAGE_SIZE + 1),
        (3 * PM_PAGE_SIZE, 10 * alignment, 4 * alignment),
        (alignment, 2 * alignment, 0),
    ];

    for &(initial_size, max_size, grow_size) in configs.iter() {
        let list = device
            .create_free_list(FreeListCreateInfo {
                initial_size,
                max_size,
                grow_size,
                grow_threshold: 0,
                parent: None,
            })
            .unwrap();
        let initial = list.size();
        assert_eq!(initial, list.initial_size());
        assert!(initial <= list.max_size());

        let mut prev = initial;
        let result = loop {
            match list.grow() {
                Ok(size) => {
                    assert_eq!(size, list.size());
                    assert_eq!(size % PM_PAGE_SIZE, 0, "{:?}", (initial_size, max_size, grow_size));
                    assert!(initial <= size && size <= list.max_size());
                    assert!(size > prev && size - prev <= list.grow_size());
                    prev = size;
                }
                Err(err) => break err,
            }
        };
        assert_eq!(result, Error::OutOfDeviceMemory);
        if list.grow_size() != 0 {
            assert_eq!(list.size(), list.max_size());
        }
    }
}
