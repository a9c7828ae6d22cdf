//! Preview page served at the camera root.

/// Minimal dark page: live stream plus a polling stats line.
pub fn preview_page(camera_name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>Meteor Detector - {camera_name}</title>
    <style>
        body {{ font-family: Arial, sans-serif; background: #1a1a2e; color: #eee; margin: 0; padding: 20px; }}
        h1 {{ color: #00d4ff; }}
        .container {{ max-width: 1200px; margin: 0 auto; }}
        .video {{ background: #000; border: 2px solid #00d4ff; border-radius: 8px; overflow: hidden; }}
        .video img {{ width: 100%; display: block; }}
        .stats {{ margin-top: 20px; padding: 15px; background: #16213e; border-radius: 8px; }}
        .stats span {{ display: inline-block; margin-right: 30px; font-size: 18px; }}
        .count {{ color: #00ff88; font-weight: bold; }}
        .dead {{ color: #ff5566; font-weight: bold; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>Meteor Detector - {camera_name}</h1>
        <div class="video"><img src="/stream" alt="Live Stream"></div>
        <div class="stats">
            <span>Status: <b id="status" class="count">-</b></span>
            <span>Detections: <b class="count" id="count">-</b></span>
            <span>FPS: <b id="fps">-</b></span>
        </div>
        <p style="color:#888; margin-top:20px;">
            Green circles: current candidates / yellow lines: open tracks
        </p>
    </div>
    <script>
        setInterval(() => {{
            fetch('/stats').then(r => r.json()).then(data => {{
                document.getElementById('count').textContent = data.detections;
                document.getElementById('fps').textContent = data.runtime_fps.toFixed(1);
                const status = document.getElementById('status');
                status.textContent = data.stream_alive ? 'RUNNING' : 'NO SIGNAL';
                status.className = data.stream_alive ? 'count' : 'dead';
            }});
        }}, 1000);
    </script>
</body>
</html>"#
    )
}
