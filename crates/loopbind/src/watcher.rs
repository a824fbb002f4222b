//! Idle, prepare and check handles

use loopbind_sdk::{AbiResult, Value};
use loopbind_uv::{HandleId, HandleType, Loop};

use crate::args::Args;
use crate::bridge::Bridge;
use crate::handle::{self, check_open, CB_EVENT};
use crate::result;

fn watcher_cb(lp: &Loop, id: HandleId) {
    handle::dispatch(lp, id, CB_EVENT, |_| Vec::new());
}

macro_rules! bound_watcher {
    ($kind:expr, $new:ident, $start:ident, $stop:ident, $init:ident, $native_start:ident, $native_stop:ident) => {
        #[doc = concat!("`", stringify!($new), "()`")]
        pub fn $new(bridge: &Bridge, _values: &[Value]) -> AbiResult<Vec<Value>> {
            let id = bridge.native().$init();
            let (_, value) = handle::create_handle(bridge, id)?;
            Ok(vec![value])
        }

        #[doc = concat!("`", stringify!($start), "(handle, callback)`")]
        pub fn $start(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
            let args = Args::new(bridge.ctx(), values);
            let wrapper = check_open(&args, 1, Some($kind))?;
            let callback = args.callable(2)?;
            wrapper.callback_set(args.ctx(), CB_EVENT, callback)?;
            Ok(result::status(bridge.native().$native_start(wrapper.id(), watcher_cb)))
        }

        #[doc = concat!("`", stringify!($stop), "(handle)`")]
        pub fn $stop(bridge: &Bridge, values: &[Value]) -> AbiResult<Vec<Value>> {
            let args = Args::new(bridge.ctx(), values);
            let wrapper = check_open(&args, 1, Some($kind))?;
            let status = bridge.native().$native_stop(wrapper.id());
            wrapper.callback_unset(args.ctx(), CB_EVENT);
            Ok(result::status(status))
        }
    };
}

bound_watcher!(HandleType::Idle, new_idle, idle_start, idle_stop, idle_init, idle_start, idle_stop);
bound_watcher!(
    HandleType::Prepare,
    new_prepare,
    prepare_start,
    prepare_stop,
    prepare_init,
    prepare_start,
    prepare_stop
);
bound_watcher!(HandleType::Check, new_check, check_start, check_stop, check_init, check_start, check_stop);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use loopbind_testkit::MockRuntime;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_phase_order() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let order = Rc::new(RefCell::new(Vec::new()));
        let weak = Rc::downgrade(&bridge);

        let mut handles = Vec::new();
        for kind in ["check", "prepare", "idle"] {
            let h = bridge.call(&format!("new_{}", kind), &[]).unwrap().remove(0);
            handles.push((kind, h));
        }
        for (kind, h) in &handles {
            let order = order.clone();
            let weak = weak.clone();
            let h2 = h.clone();
            let kind = *kind;
            let cb = rt.function(move |_, _| {
                order.borrow_mut().push(kind);
                let bridge = weak.upgrade().unwrap();
                bridge.call(&format!("{}_stop", kind), &[h2.clone()])?;
                Ok(vec![])
            });
            let out = bridge.call(&format!("{}_start", kind), &[h.clone(), cb]).unwrap();
            assert_eq!(out, vec![Value::Boolean(true)]);
        }

        bridge.call("run", &[Value::from("nowait")]).unwrap();
        assert_eq!(*order.borrow(), vec!["idle", "prepare", "check"]);
        for (_, h) in handles {
            assert_eq!(bridge.call("is_active", &[h]).unwrap(), vec![Value::Boolean(false)]);
        }
    }

    #[test]
    fn test_start_requires_callable() {
        let rt = MockRuntime::new();
        let bridge = Bridge::new(rt.clone(), Config::new());
        let idle = bridge.call("new_idle", &[]).unwrap().remove(0);
        let err = bridge.call("idle_start", &[idle, Value::from("nope")]).unwrap_err();
        assert_eq!(err.to_string(), "bad argument #2 (expected callable, got string)");
    }
}
