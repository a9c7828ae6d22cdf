//! Dashboard overview page.

use crate::dashboard::config::CameraEndpoint;

/// Camera grid plus the recent-detections panel. The page polls
/// `/detections_mtime` and only refetches the listing when it moves.
pub fn dashboard_page(cameras: &[CameraEndpoint]) -> String {
    let camera_cells: String = cameras
        .iter()
        .enumerate()
        .map(|(i, cam)| {
            format!(
                r#"<div class="camera">
    <h2>{name}</h2>
    <div class="video"><img src="/camera_stream/{i}" alt="{name}"></div>
    <div class="row">
        <span id="cam-stats-{i}">-</span>
        <a href="/camera_snapshot/{i}?download=1">snapshot</a>
        <button onclick="restartCamera({i})">restart</button>
    </div>
</div>"#,
                name = cam.name,
            )
        })
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Meteor Dashboard</title>
    <style>
        body {{ font-family: Arial, sans-serif; background: #1a1a2e; color: #eee; margin: 0; padding: 20px; }}
        h1 {{ color: #00d4ff; }}
        h2 {{ color: #00d4ff; font-size: 16px; margin: 6px 0; }}
        .grid {{ display: grid; grid-template-columns: repeat(auto-fit, minmax(380px, 1fr)); gap: 16px; }}
        .camera {{ background: #16213e; border-radius: 8px; padding: 10px; }}
        .video {{ background: #000; border: 1px solid #00d4ff; border-radius: 6px; overflow: hidden; }}
        .video img {{ width: 100%; display: block; }}
        .row {{ display: flex; gap: 12px; align-items: center; margin-top: 8px; font-size: 13px; color: #9ab; }}
        .row a {{ color: #00d4ff; }}
        button {{ background: #0f3460; color: #eee; border: 1px solid #00d4ff; border-radius: 4px; cursor: pointer; }}
        #detections {{ margin-top: 24px; }}
        .det {{ display: flex; gap: 12px; align-items: center; background: #16213e; border-radius: 6px; padding: 8px; margin-bottom: 6px; }}
        .det img {{ height: 60px; border-radius: 4px; }}
        .det .meta {{ flex: 1; }}
        .label-meteor {{ color: #00ff88; }}
        .label-non-meteor {{ color: #ff5566; }}
    </style>
</head>
<body>
    <h1>Meteor Dashboard</h1>
    <div class="grid">{camera_cells}</div>
    <div id="detections">
        <h2>Recent detections (<span id="total">0</span>)</h2>
        <div id="list"></div>
    </div>
    <script>
        let lastMtime = -1;

        function restartCamera(i) {{
            fetch('/camera_restart/' + i, {{method: 'POST'}});
        }}

        function setLabel(camera, timestamp, label) {{
            fetch('/detection_label', {{
                method: 'POST',
                headers: {{'Content-Type': 'application/json'}},
                body: JSON.stringify({{camera, timestamp, label}}),
            }}).then(() => {{ lastMtime = -1; }});
        }}

        function deleteDetection(camera, time) {{
            fetch('/detection/' + camera + '/' + encodeURIComponent(time), {{method: 'DELETE'}})
                .then(() => {{ lastMtime = -1; }});
        }}

        function renderDetections(data) {{
            document.getElementById('total').textContent = data.total;
            const list = document.getElementById('list');
            list.innerHTML = '';
            for (const d of data.recent.slice(0, 100)) {{
                const div = document.createElement('div');
                div.className = 'det';
                div.innerHTML = `
                    <a href="/image/${{d.image}}" target="_blank"><img src="/image/${{d.image}}"></a>
                    <div class="meta">
                        <div>${{d.time}} &mdash; ${{d.camera}} &mdash; ${{d.confidence}}
                            <span class="label-${{d.label}}">${{d.label}}</span></div>
                        <div>
                            ${{d.mp4 ? `<a href="/image/${{d.mp4}}" target="_blank">clip</a>` : ''}}
                            <button onclick="setLabel('${{d.camera}}','${{d.timestamp}}','meteor')">meteor</button>
                            <button onclick="setLabel('${{d.camera}}','${{d.timestamp}}','non-meteor')">non-meteor</button>
                            <button onclick="deleteDetection('${{d.camera}}','${{d.time}}')">delete</button>
                        </div>
                    </div>`;
                list.appendChild(div);
            }}
        }}

        setInterval(() => {{
            fetch('/detections_mtime').then(r => r.json()).then(data => {{
                if (data.mtime !== lastMtime) {{
                    lastMtime = data.mtime;
                    fetch('/detections').then(r => r.json()).then(renderDetections);
                }}
            }});
        }}, 2000);

        setInterval(() => {{
            document.querySelectorAll('[id^="cam-stats-"]').forEach((el) => {{
                const i = el.id.split('-')[2];
                fetch('/camera_stats/' + i).then(r => r.json()).then(data => {{
                    const s = data.stats || {{}};
                    const alive = s.stream_alive ? 'live' : 'down';
                    el.textContent = `${{alive}} | ${{s.detections ?? '-'}} detections` +
                        (data.monitor_stop_reason ? ` | ${{data.monitor_stop_reason}}` : '');
                }});
            }});
        }}, 5000);
    </script>
</body>
</html>"#
    )
}
